//! Telegram Bot API client used as the façade (and bot-master) identity.
//!
//! Failed calls are retried only when a repeat cannot duplicate a side effect:
//! connect failures and rate limiting always, timeouts and server errors only
//! for idempotent methods. `sendMessage` is never repeated after a response
//! that may have been accepted.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use relay_runtime::{BotIdentity, BotProfile, TransportError};
use relay_types::BotCommand;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const ERROR_BODY_MAX_CHARS: usize = 400;

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
    parameters: Option<TelegramResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct TelegramResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    first_name: String,
    last_name: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
}

/// One entry returned by `getUpdates`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramIncomingMessage>,
}

/// The subset of an incoming message the relay consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramIncomingMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TelegramBotCommand {
    command: String,
    description: String,
}

/// Connection settings for [`TelegramBotClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramClientConfig {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for TelegramClientConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// Bot API client bound to one bot token.
#[derive(Clone)]
pub struct TelegramBotClient {
    http: reqwest::Client,
    request_timeout: Duration,
    api_base: String,
    token: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl TelegramBotClient {
    pub fn new(config: &TelegramClientConfig, token: &str) -> Result<Self> {
        let token = token.trim();
        if token.is_empty() {
            bail!("telegram bot token must not be empty");
        }
        let request_timeout = Duration::from_millis(config.request_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to create telegram api client")?;
        Ok(Self {
            http,
            request_timeout,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    /// Sends `text` to `chat_id`, split into message-sized chunks. Returns the
    /// id of the last message sent.
    ///
    /// Chunks are sent in order and stop at the first failure. Chunks sent
    /// before it stay delivered; the error reports how many went out.
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<i64> {
        let chat = chat_id_value(chat_id)?;
        let chunks = chunk_text(text, TELEGRAM_MAX_MESSAGE_CHARS);
        if chunks.is_empty() {
            bail!("telegram sendMessage requires non-empty text");
        }
        let total = chunks.len();
        let mut last_message_id = 0;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let message: TelegramMessage = self
                .call("sendMessage", json!({ "chat_id": chat, "text": chunk }))
                .await
                .with_context(|| {
                    format!("telegram sendMessage delivered {index} of {total} chunks")
                })?;
            last_message_id = message.message_id;
        }
        Ok(last_message_id)
    }

    /// Fetches updates after `offset`, long-polling up to `long_poll_secs`.
    pub async fn get_updates(&self, offset: i64, long_poll_secs: u64) -> Result<Vec<TelegramUpdate>> {
        let payload = json!({
            "offset": offset,
            "timeout": long_poll_secs,
            "allowed_updates": ["message"],
        });
        let timeout = self.request_timeout + Duration::from_secs(long_poll_secs);
        self.call_with_timeout("getUpdates", payload, timeout).await
    }

    pub async fn set_my_commands(&self, commands: &[BotCommand]) -> Result<()> {
        let commands: Vec<TelegramBotCommand> = commands
            .iter()
            .map(|command| TelegramBotCommand {
                command: command.command.clone(),
                description: command.description.clone(),
            })
            .collect();
        let accepted: bool = self
            .call("setMyCommands", json!({ "commands": commands }))
            .await?;
        if !accepted {
            bail!("telegram setMyCommands was not accepted");
        }
        Ok(())
    }

    pub async fn get_me(&self) -> Result<BotProfile> {
        let user: TelegramUser = self.call("getMe", json!({})).await?;
        let display_name = match user.last_name {
            Some(last_name) if !last_name.trim().is_empty() => {
                format!("{} {}", user.first_name, last_name.trim())
            }
            _ => user.first_name,
        };
        Ok(BotProfile {
            id: user.id,
            username: user.username,
            display_name,
        })
    }

    pub async fn get_my_commands(&self) -> Result<Vec<BotCommand>> {
        let commands: Vec<TelegramBotCommand> = self.call("getMyCommands", json!({})).await?;
        Ok(commands
            .into_iter()
            .map(|command| BotCommand::new(command.command, command.description))
            .collect())
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: Value) -> Result<T> {
        self.call_with_timeout(method, payload, self.request_timeout)
            .await
    }

    async fn call_with_timeout<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<T> {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = self
                .http
                .post(self.method_url(method))
                .timeout(timeout)
                .json(&payload)
                .send()
                .await;
            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    let cause = if error.is_connect() {
                        Some(RetryCause::Connect)
                    } else if error.is_timeout() {
                        Some(RetryCause::Timeout)
                    } else {
                        None
                    };
                    if attempt < self.retry_max_attempts
                        && cause.is_some_and(|cause| may_retry(method, cause))
                    {
                        tracing::debug!(method, attempt, ?cause, "retrying telegram api call");
                        tokio::time::sleep(self.retry_delay(attempt, None)).await;
                        continue;
                    }
                    return Err(error.without_url())
                        .with_context(|| format!("telegram api {method} request failed"));
                }
            };

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(reqwest::Error::without_url)
                .with_context(|| format!("failed to read telegram {method} response"))?;
            let envelope: TelegramEnvelope<T> = match serde_json::from_str(&body) {
                Ok(envelope) => envelope,
                Err(_) => bail!(
                    "telegram api {method} failed with status {}: {}",
                    status.as_u16(),
                    truncate_for_error(&body)
                ),
            };
            if envelope.ok {
                return envelope
                    .result
                    .ok_or_else(|| anyhow!("telegram api {method} returned no result"));
            }

            let cause = if status.as_u16() == 429 {
                Some(RetryCause::RateLimited)
            } else if status.is_server_error() {
                Some(RetryCause::ServerError)
            } else {
                None
            };
            if attempt < self.retry_max_attempts
                && cause.is_some_and(|cause| may_retry(method, cause))
            {
                let retry_after = envelope
                    .parameters
                    .and_then(|parameters| parameters.retry_after);
                tracing::debug!(method, attempt, status = status.as_u16(), "retrying telegram api call");
                tokio::time::sleep(self.retry_delay(attempt, retry_after)).await;
                continue;
            }
            bail!(
                "telegram api {method} failed ({}): {}",
                envelope.error_code.unwrap_or(i64::from(status.as_u16())),
                envelope
                    .description
                    .unwrap_or_else(|| "unknown error".to_string())
            );
        }
    }

    fn retry_delay(&self, attempt: usize, retry_after_secs: Option<u64>) -> Duration {
        match retry_after_secs {
            Some(seconds) => Duration::from_secs(seconds),
            None => Duration::from_millis(
                self.retry_base_delay_ms
                    .saturating_mul(u64::try_from(attempt).unwrap_or(u64::MAX)),
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryCause {
    /// The request never reached the server.
    Connect,
    /// Telegram refused the request before processing it.
    RateLimited,
    /// The request may or may not have been processed.
    Timeout,
    ServerError,
}

fn is_idempotent(method: &str) -> bool {
    matches!(method, "getMe" | "getMyCommands" | "setMyCommands" | "getUpdates")
}

fn may_retry(method: &str, cause: RetryCause) -> bool {
    match cause {
        RetryCause::Connect | RetryCause::RateLimited => true,
        RetryCause::Timeout | RetryCause::ServerError => is_idempotent(method),
    }
}

fn transport_error(error: anyhow::Error) -> TransportError {
    TransportError::Request(format!("{error:#}"))
}

#[async_trait]
impl BotIdentity for TelegramBotClient {
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        self.send_text(destination, text)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }

    async fn set_command_menu(&self, commands: &[BotCommand]) -> Result<(), TransportError> {
        self.set_my_commands(commands).await.map_err(transport_error)
    }

    async fn get_self_info(&self) -> Result<BotProfile, TransportError> {
        self.get_me().await.map_err(transport_error)
    }

    async fn get_command_menu(&self) -> Result<Vec<BotCommand>, TransportError> {
        self.get_my_commands().await.map_err(transport_error)
    }
}

/// Numeric chat ids are sent as integers; `@channel` style ids as strings.
fn chat_id_value(chat_id: &str) -> Result<Value> {
    let chat_id = chat_id.trim();
    if chat_id.is_empty() {
        bail!("telegram chat id must not be empty");
    }
    Ok(match chat_id.parse::<i64>() {
        Ok(numeric) => Value::from(numeric),
        Err(_) => Value::String(chat_id.to_string()),
    })
}

fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }
    let characters: Vec<char> = text.chars().collect();
    characters
        .chunks(max_chars)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn truncate_for_error(body: &str) -> String {
    if body.chars().count() <= ERROR_BODY_MAX_CHARS {
        return body.to_string();
    }
    let mut truncated: String = body.chars().take(ERROR_BODY_MAX_CHARS).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use super::*;

    fn client(server: &MockServer) -> TelegramBotClient {
        client_with_attempts(server, 1)
    }

    fn client_with_attempts(server: &MockServer, retry_max_attempts: usize) -> TelegramBotClient {
        TelegramBotClient::new(
            &TelegramClientConfig {
                api_base: server.base_url(),
                request_timeout_ms: 2_000,
                retry_max_attempts,
                retry_base_delay_ms: 1,
            },
            "test-token",
        )
        .expect("client")
    }

    #[tokio::test]
    async fn send_message_posts_numeric_chat_id() {
        let server = MockServer::start();
        let sent = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .json_body(json!({"chat_id": 7555202218_i64, "text": "hello"}));
            then.status(200)
                .json_body(json!({"ok": true, "result": {"message_id": 55}}));
        });

        let message_id = client(&server)
            .send_text("7555202218", "hello")
            .await
            .expect("send");
        sent.assert_calls(1);
        assert_eq!(message_id, 55);
    }

    #[tokio::test]
    async fn long_messages_are_split_into_chunks() {
        let server = MockServer::start();
        let sent = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(200)
                .json_body(json!({"ok": true, "result": {"message_id": 1}}));
        });

        let text = "x".repeat(TELEGRAM_MAX_MESSAGE_CHARS + 10);
        client(&server)
            .send_message("@relay_channel", &text)
            .await
            .expect("send");
        sent.assert_calls(2);
    }

    #[tokio::test]
    async fn api_errors_surface_description() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(400).json_body(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: chat not found"
            }));
        });

        let error = client(&server)
            .send_message("42", "hello")
            .await
            .expect_err("chat not found");
        match error {
            TransportError::Request(detail) => {
                assert!(detail.contains("chat not found"), "{detail}");
                assert!(!detail.contains("test-token"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn command_menu_round_trips_through_api() {
        let server = MockServer::start();
        let set = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/setMyCommands")
                .json_body(json!({"commands": [
                    {"command": "help", "description": "Tampilkan bantuan"},
                    {"command": "quota", "description": "Cek kuota"}
                ]}));
            then.status(200).json_body(json!({"ok": true, "result": true}));
        });
        let get = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getMyCommands");
            then.status(200).json_body(json!({"ok": true, "result": [
                {"command": "help", "description": "Tampilkan bantuan"}
            ]}));
        });

        let client = client(&server);
        client
            .set_command_menu(&[
                BotCommand::new("help", "Tampilkan bantuan"),
                BotCommand::new("quota", "Cek kuota"),
            ])
            .await
            .expect("set menu");
        let menu = client.get_command_menu().await.expect("get menu");
        set.assert_calls(1);
        get.assert_calls(1);
        assert_eq!(menu, vec![BotCommand::new("help", "Tampilkan bantuan")]);
    }

    #[tokio::test]
    async fn get_me_builds_profile() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getMe");
            then.status(200).json_body(json!({"ok": true, "result": {
                "id": 99,
                "is_bot": true,
                "first_name": "Master",
                "last_name": "Lookup",
                "username": "MasterBot"
            }}));
        });

        let profile = client(&server).get_self_info().await.expect("profile");
        assert_eq!(
            profile,
            BotProfile {
                id: 99,
                username: Some("MasterBot".to_string()),
                display_name: "Master Lookup".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn server_errors_repeat_only_idempotent_calls() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(502).json_body(json!({
                "ok": false,
                "error_code": 502,
                "description": "Bad Gateway"
            }));
        });
        let get_me = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/getMe");
            then.status(502).json_body(json!({
                "ok": false,
                "error_code": 502,
                "description": "Bad Gateway"
            }));
        });

        let client = client_with_attempts(&server, 3);
        assert!(client.send_text("42", "reply").await.is_err());
        assert!(client.get_me().await.is_err());
        send.assert_calls(1);
        get_me.assert_calls(3);
    }

    #[tokio::test]
    async fn rate_limited_send_is_repeated() {
        let server = MockServer::start();
        let limited = server.mock(|when, then| {
            when.method(POST).path("/bottest-token/sendMessage");
            then.status(429).json_body(json!({
                "ok": false,
                "error_code": 429,
                "description": "Too Many Requests: retry after 0",
                "parameters": {"retry_after": 0}
            }));
        });

        let error = client_with_attempts(&server, 2)
            .send_text("42", "reply")
            .await
            .expect_err("still limited");
        limited.assert_calls(2);
        assert!(format!("{error:#}").contains("Too Many Requests"));
    }

    #[tokio::test]
    async fn failed_chunk_reports_partial_delivery() {
        let server = MockServer::start();
        let first = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .body_includes("xxxx");
            then.status(200)
                .json_body(json!({"ok": true, "result": {"message_id": 1}}));
        });
        let second = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/sendMessage")
                .body_includes("yyyy");
            then.status(400).json_body(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: message is too long"
            }));
        });

        let text = format!(
            "{}{}",
            "x".repeat(TELEGRAM_MAX_MESSAGE_CHARS),
            "y".repeat(10)
        );
        let error = client(&server)
            .send_text("42", &text)
            .await
            .expect_err("second chunk rejected");
        first.assert_calls(1);
        second.assert_calls(1);
        assert!(format!("{error:#}").contains("delivered 1 of 2 chunks"), "{error:#}");
    }

    #[test]
    fn ambiguous_failures_repeat_only_idempotent_methods() {
        assert!(may_retry("sendMessage", RetryCause::Connect));
        assert!(may_retry("sendMessage", RetryCause::RateLimited));
        assert!(!may_retry("sendMessage", RetryCause::Timeout));
        assert!(!may_retry("sendMessage", RetryCause::ServerError));
        assert!(may_retry("getUpdates", RetryCause::Timeout));
        assert!(may_retry("setMyCommands", RetryCause::ServerError));
    }

    #[tokio::test]
    async fn get_updates_decodes_messages() {
        let server = MockServer::start();
        let updates = server.mock(|when, then| {
            when.method(POST)
                .path("/bottest-token/getUpdates")
                .json_body(json!({"offset": 7, "timeout": 0, "allowed_updates": ["message"]}));
            then.status(200).json_body(json!({"ok": true, "result": [
                {"update_id": 7, "message": {
                    "message_id": 1,
                    "chat": {"id": 1001, "type": "private"},
                    "text": "/quota"
                }},
                {"update_id": 8, "edited_message": {"message_id": 1}}
            ]}));
        });

        let fetched = client(&server).get_updates(7, 0).await.expect("updates");
        updates.assert_calls(1);
        assert_eq!(fetched.len(), 2);
        let message = fetched[0].message.as_ref().expect("message");
        assert_eq!(message.chat.id, 1001);
        assert_eq!(message.text.as_deref(), Some("/quota"));
        assert!(fetched[1].message.is_none());
    }

    #[test]
    fn rejects_blank_token_and_chat_id() {
        assert!(TelegramBotClient::new(&TelegramClientConfig::default(), "  ").is_err());
        assert!(chat_id_value(" ").is_err());
        assert_eq!(chat_id_value("-100123").expect("id"), json!(-100123));
        assert_eq!(chat_id_value("@news").expect("id"), json!("@news"));
    }

    #[test]
    fn chunk_text_respects_character_boundaries() {
        let chunks = chunk_text("ééééé", 2);
        assert_eq!(chunks, vec!["éé", "éé", "é"]);
        assert!(chunk_text("", 10).is_empty());
    }
}
