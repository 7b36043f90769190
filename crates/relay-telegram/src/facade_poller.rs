//! Long-polling loop that serves one façade bot.
//!
//! Every command a user sends to the façade is relayed to the master through
//! [`RelayCorrelator::handle_user_command`]; the correlator delivers the reply
//! (or a failure notice) back to the user's chat. Updates are handled one at a
//! time in arrival order, so commands from one façade reach the master in the
//! order users sent them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use relay_runtime::{RelayCorrelator, DEFAULT_RELAY_TIMEOUT};
use relay_types::InstanceId;

use crate::bot_api_client::{TelegramBotClient, TelegramUpdate};

pub const DEFAULT_LONG_POLL_SECS: u64 = 25;
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(3);

/// Settings for [`FacadePoller`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacadePollerConfig {
    pub long_poll_secs: u64,
    pub relay_timeout: Duration,
    pub error_backoff: Duration,
}

impl Default for FacadePollerConfig {
    fn default() -> Self {
        Self {
            long_poll_secs: DEFAULT_LONG_POLL_SECS,
            relay_timeout: DEFAULT_RELAY_TIMEOUT,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }
}

/// Counters for one or more poll cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollCycleReport {
    pub cycles: u64,
    pub updates: usize,
    pub relayed: usize,
    pub failed: usize,
    pub ignored: usize,
}

impl PollCycleReport {
    fn absorb(&mut self, other: PollCycleReport) {
        self.cycles = self.cycles.saturating_add(other.cycles);
        self.updates = self.updates.saturating_add(other.updates);
        self.relayed = self.relayed.saturating_add(other.relayed);
        self.failed = self.failed.saturating_add(other.failed);
        self.ignored = self.ignored.saturating_add(other.ignored);
    }
}

/// Relays commands received by a façade bot to its instance's master.
pub struct FacadePoller {
    client: Arc<TelegramBotClient>,
    correlator: Arc<RelayCorrelator>,
    instance_id: InstanceId,
    config: FacadePollerConfig,
    next_offset: i64,
}

impl FacadePoller {
    pub fn new(
        client: Arc<TelegramBotClient>,
        correlator: Arc<RelayCorrelator>,
        instance_id: InstanceId,
        config: FacadePollerConfig,
    ) -> Self {
        Self {
            client,
            correlator,
            instance_id,
            config,
            next_offset: 0,
        }
    }

    /// Offset passed to the next `getUpdates` call.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    /// Fetches one batch of updates and relays the commands in it.
    #[tracing::instrument(
        name = "relay.telegram.poll",
        skip_all,
        fields(instance_id = %self.instance_id, offset = self.next_offset)
    )]
    pub async fn poll_once(&mut self) -> Result<PollCycleReport> {
        let updates = self
            .client
            .get_updates(self.next_offset, self.config.long_poll_secs)
            .await?;
        let mut report = PollCycleReport {
            cycles: 1,
            updates: updates.len(),
            ..PollCycleReport::default()
        };
        for update in updates {
            self.next_offset = self.next_offset.max(update.update_id.saturating_add(1));
            let Some((chat_id, command)) = command_from_update(&update) else {
                report.ignored += 1;
                continue;
            };
            let outcome = self
                .correlator
                .handle_user_command(
                    &self.instance_id,
                    &command,
                    &chat_id,
                    self.config.relay_timeout,
                )
                .await;
            match outcome {
                Ok(_) => report.relayed += 1,
                Err(error) => {
                    tracing::warn!(update_id = update.update_id, error = %error, "relay failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Polls until `shutdown` resolves or `max_cycles` cycles have completed.
    ///
    /// Failed polls are logged and retried after the configured backoff.
    pub async fn run<F>(&mut self, shutdown: F, max_cycles: Option<u64>) -> PollCycleReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut total = PollCycleReport::default();
        loop {
            if max_cycles.is_some_and(|limit| total.cycles >= limit) {
                return total;
            }
            tokio::select! {
                _ = &mut shutdown => return total,
                polled = self.poll_once() => match polled {
                    Ok(report) => total.absorb(report),
                    Err(error) => {
                        total.cycles = total.cycles.saturating_add(1);
                        tracing::warn!(error = %format!("{error:#}"), "telegram poll failed");
                        tokio::select! {
                            _ = &mut shutdown => return total,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                },
            }
        }
    }
}

/// Chat id and master-ready command text of a user command update.
///
/// `/cmd@facade_bot args` is forwarded as `/cmd args`; non-command messages
/// yield `None`.
fn command_from_update(update: &TelegramUpdate) -> Option<(String, String)> {
    let message = update.message.as_ref()?;
    let text = message.text.as_deref()?.trim();
    if !text.starts_with('/') {
        return None;
    }
    let (head, args) = match text.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (text, ""),
    };
    let token = head.split_once('@').map_or(head, |(token, _)| token);
    if token.len() < 2 {
        return None;
    }
    let command = if args.is_empty() {
        token.to_string()
    } else {
        format!("{token} {args}")
    };
    Some((message.chat.id.to_string(), command))
}
