//! Catalog synchronization: probe the master, extract, persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use relay_catalog::{extract, render_menu_text};
use relay_core::Clock;
use relay_store::{InstanceStore, StoreError};
use relay_types::{
    BotCommand, CommandCategory, CommandEntry, FacadeInstance, InstanceId, InstanceStatus,
    MasterStatusSnapshot,
};
use thiserror::Error;

use crate::identity::{IdentityResolver, TransportError};
use crate::relay_correlator::{describe_status, RelayCorrelator, RelayError, DEFAULT_RELAY_TIMEOUT};

/// Commands sent by [`RelayProbe`] when none are configured.
pub const DEFAULT_PROBE_COMMANDS: &[&str] = &["/help"];

const MAX_MENU_COMMANDS: usize = 100;
const MAX_MENU_TOKEN_CHARS: usize = 32;
const MAX_MENU_DESCRIPTION_CHARS: usize = 256;

/// Failure to obtain reply text from a master.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("master sent no reply within {0:?}")]
    NoReply(Duration),
    #[error("probe refused: {0}")]
    Refused(String),
}

impl From<RelayError> for ProbeError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::Timeout(waited) => Self::NoReply(waited),
            RelayError::Transport(transport) => Self::Transport(transport),
            other => Self::Refused(other.to_string()),
        }
    }
}

/// Obtains text describing a master's commands and account status.
#[async_trait]
pub trait MasterProbe: Send + Sync {
    async fn probe(&self, instance: &FacadeInstance) -> Result<String, ProbeError>;
}

/// Reads the master's self info and command menu through a bot identity bound
/// to the instance's master credential.
pub struct BotMenuProbe {
    identities: Arc<dyn IdentityResolver>,
}

impl BotMenuProbe {
    pub fn new(identities: Arc<dyn IdentityResolver>) -> Self {
        Self { identities }
    }
}

#[async_trait]
impl MasterProbe for BotMenuProbe {
    async fn probe(&self, instance: &FacadeInstance) -> Result<String, ProbeError> {
        let master = self.identities.bot(&instance.master_cred)?;
        let profile = master.get_self_info().await?;
        let menu = master.get_command_menu().await?;

        let header = match profile.username.as_deref() {
            Some(username) => format!("{} (@{username})", profile.display_name),
            None => profile.display_name,
        };
        let body = render_menu_text(&menu);
        if body.is_empty() {
            Ok(header)
        } else {
            Ok(format!("{header}\n\n{body}"))
        }
    }
}

/// Sends probe commands on the master conversation and concatenates the
/// replies. Probing is serialized with user relays and charges no quota.
pub struct RelayProbe {
    correlator: Arc<RelayCorrelator>,
    commands: Vec<String>,
    timeout: Duration,
}

impl RelayProbe {
    pub fn new(correlator: Arc<RelayCorrelator>) -> Self {
        Self {
            correlator,
            commands: DEFAULT_PROBE_COMMANDS
                .iter()
                .map(|command| command.to_string())
                .collect(),
            timeout: DEFAULT_RELAY_TIMEOUT,
        }
    }

    pub fn with_commands(mut self, commands: Vec<String>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MasterProbe for RelayProbe {
    async fn probe(&self, instance: &FacadeInstance) -> Result<String, ProbeError> {
        let mut replies = Vec::with_capacity(self.commands.len());
        for command in &self.commands {
            let reply = self
                .correlator
                .probe(instance, command, self.timeout)
                .await?;
            replies.push(reply);
        }
        Ok(replies.join("\n\n"))
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors returned by the sync orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("instance '{instance_id}' is not available for sync ({})", describe_status(.status))]
    InstanceUnavailable {
        instance_id: InstanceId,
        status: Option<InstanceStatus>,
    },
    #[error("master unreachable: {0}")]
    MasterUnreachable(#[source] ProbeError),
    #[error("failed to publish command menu: {0}")]
    MenuPublish(#[source] TransportError),
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for SyncError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InstanceNotFound(instance_id) => Self::InstanceUnavailable {
                instance_id,
                status: None,
            },
            other => Self::Storage(other),
        }
    }
}

/// Outcome of one successful sync.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub instance_id: InstanceId,
    pub entries_found: usize,
    pub general_commands: usize,
    pub parametric_commands: usize,
    pub status: Option<MasterStatusSnapshot>,
    pub synced_at: DateTime<Utc>,
}

/// Refreshes persisted catalogs from live master replies.
pub struct SyncOrchestrator {
    store: Arc<dyn InstanceStore>,
    probe: Arc<dyn MasterProbe>,
    identities: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        probe: Arc<dyn MasterProbe>,
        identities: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            probe,
            identities,
            clock,
        }
    }

    async fn load_active(&self, instance_id: &InstanceId) -> SyncResult<FacadeInstance> {
        let instance =
            self.store
                .find_by_id(instance_id)
                .await?
                .ok_or_else(|| SyncError::InstanceUnavailable {
                    instance_id: instance_id.clone(),
                    status: None,
                })?;
        let status = instance.status_at(self.clock.now());
        if status != InstanceStatus::Active {
            return Err(SyncError::InstanceUnavailable {
                instance_id: instance_id.clone(),
                status: Some(status),
            });
        }
        Ok(instance)
    }

    /// Probes the master and replaces the stored catalog with what it reports.
    ///
    /// A reply without recognizable commands is still recorded: the catalog is
    /// emptied and `last_sync` advances. Probe failures write nothing.
    #[tracing::instrument(name = "relay.sync", skip_all, fields(instance_id = %instance_id))]
    pub async fn sync(&self, instance_id: &InstanceId) -> SyncResult<SyncReport> {
        let instance = self.load_active(instance_id).await?;

        let reply = match self.probe.probe(&instance).await {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(error = %error, "master probe failed");
                return Err(SyncError::MasterUnreachable(error));
            }
        };

        let catalog = extract(&reply);
        let synced_at = self.clock.now();
        let general_commands = catalog.count_by_category(CommandCategory::General);
        let parametric_commands = catalog.count_by_category(CommandCategory::Parametric);
        let entries: Vec<CommandEntry> = catalog
            .entries
            .into_iter()
            .map(|command| command.into_entry(instance_id, synced_at))
            .collect();
        let status = catalog
            .status
            .map(|status| status.into_snapshot(instance_id, synced_at));

        self.store
            .replace_catalog(instance_id, entries, status.clone(), synced_at)
            .await?;
        tracing::debug!(
            entries = catalog.total_commands,
            general_commands,
            parametric_commands,
            has_status = status.is_some(),
            "catalog synced"
        );

        Ok(SyncReport {
            instance_id: instance_id.clone(),
            entries_found: catalog.total_commands,
            general_commands,
            parametric_commands,
            status,
            synced_at,
        })
    }

    /// Pushes the stored catalog to the façade bot's command menu and returns
    /// the menu that was set.
    #[tracing::instrument(name = "relay.publish_menu", skip_all, fields(instance_id = %instance_id))]
    pub async fn publish_command_menu(&self, instance_id: &InstanceId) -> SyncResult<Vec<BotCommand>> {
        let instance = self.load_active(instance_id).await?;
        let entries = self.store.list_commands(instance_id).await?;
        let menu = build_command_menu(&entries);

        let bot = self
            .identities
            .bot(&instance.facade_cred)
            .map_err(SyncError::MenuPublish)?;
        bot.set_command_menu(&menu)
            .await
            .map_err(SyncError::MenuPublish)?;
        tracing::debug!(commands = menu.len(), "command menu published");
        Ok(menu)
    }
}

/// Converts catalog entries into a bot command menu.
///
/// Tokens are lowercased and must consist of `a-z`, `0-9` and `_` with at
/// most 32 characters; others are dropped. The first entry per token wins.
/// Empty descriptions fall back to the usage template, then the token.
pub fn build_command_menu(entries: &[CommandEntry]) -> Vec<BotCommand> {
    let mut seen = HashSet::new();
    let mut menu = Vec::new();
    for entry in entries {
        let token = entry.token.trim_start_matches('/').to_lowercase();
        if !is_menu_token(&token) || !seen.insert(token.clone()) {
            continue;
        }
        let description = [
            entry.description.trim(),
            entry.usage_template.as_deref().unwrap_or_default().trim(),
        ]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("/{token}"));
        let description: String = description.chars().take(MAX_MENU_DESCRIPTION_CHARS).collect();
        menu.push(BotCommand::new(token, description));
        if menu.len() == MAX_MENU_COMMANDS {
            break;
        }
    }
    menu
}

fn is_menu_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_MENU_TOKEN_CHARS
        && token
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
}
