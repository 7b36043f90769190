//! Credential resolution backed by Telegram bot tokens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use relay_runtime::{BotIdentity, IdentityResolver, ListenerIdentity, TransportError};

use crate::bot_api_client::{TelegramBotClient, TelegramClientConfig};

/// Resolves bot credentials to [`TelegramBotClient`]s, one per token.
///
/// Listener identities speak the user-account protocol, which this crate does
/// not implement; they must be registered explicitly with
/// [`TelegramIdentities::with_listener`].
pub struct TelegramIdentities {
    config: TelegramClientConfig,
    bots: Mutex<HashMap<String, Arc<TelegramBotClient>>>,
    listeners: HashMap<String, Arc<dyn ListenerIdentity>>,
}

impl TelegramIdentities {
    pub fn new(config: TelegramClientConfig) -> Self {
        Self {
            config,
            bots: Mutex::new(HashMap::new()),
            listeners: HashMap::new(),
        }
    }

    pub fn with_listener(
        mut self,
        credential: impl Into<String>,
        listener: Arc<dyn ListenerIdentity>,
    ) -> Self {
        self.listeners.insert(credential.into(), listener);
        self
    }

    pub fn config(&self) -> &TelegramClientConfig {
        &self.config
    }

    /// Concrete client for a bot token, shared with [`IdentityResolver::bot`].
    pub fn bot_client(&self, token: &str) -> Result<Arc<TelegramBotClient>, TransportError> {
        let mut bots = self.bots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = bots.get(token) {
            return Ok(client.clone());
        }
        let client = TelegramBotClient::new(&self.config, token).map_err(|error| {
            tracing::warn!(error = %error, "failed to build telegram bot client");
            TransportError::IdentityUnavailable
        })?;
        let client = Arc::new(client);
        bots.insert(token.to_string(), client.clone());
        Ok(client)
    }
}

impl IdentityResolver for TelegramIdentities {
    fn listener(&self, credential: &str) -> Result<Arc<dyn ListenerIdentity>, TransportError> {
        self.listeners
            .get(credential)
            .cloned()
            .ok_or(TransportError::IdentityUnavailable)
    }

    fn bot(&self, credential: &str) -> Result<Arc<dyn BotIdentity>, TransportError> {
        let client: Arc<dyn BotIdentity> = self.bot_client(credential)?;
        Ok(client)
    }
}
