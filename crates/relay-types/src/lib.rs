//! Shared data types for façade relay instances and their command catalogs.

use chrono::{DateTime, Utc};
use relay_core::{expires_after_hours, is_expired_at};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default relay quota granted to a new instance.
pub const DEFAULT_QUOTA_LIMIT: u32 = 100;
/// Default lifetime of a new instance, in hours.
pub const DEFAULT_DURATION_HOURS: u32 = 24;

/// Error returned when a stored enum value cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariantError {
    pub kind: &'static str,
    pub value: String,
}

/// Identifier of a façade instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Lifecycle state for a façade instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Active,
    Suspended,
    Expired,
}

impl InstanceStatus {
    /// Computes the status from expiry and the active flag.
    ///
    /// Expiry wins over suspension: an instance past `expires_at` is expired
    /// regardless of what was stored.
    pub fn evaluate(expires_at: DateTime<Utc>, active: bool, now: DateTime<Utc>) -> Self {
        if is_expired_at(expires_at, now) {
            Self::Expired
        } else if !active {
            Self::Suspended
        } else {
            Self::Active
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownVariantError> {
        match value {
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            "expired" => Ok(Self::Expired),
            _ => Err(UnknownVariantError {
                kind: "instance_status",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tenant's relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacadeInstance {
    pub instance_id: InstanceId,
    pub name: String,
    /// Reference to the façade bot credential (token or secret handle).
    pub facade_cred: String,
    /// Reference to the credential used to reach the master (listener session or bot token).
    pub master_cred: String,
    /// Username or numeric id of the master peer.
    pub master_peer: String,
    pub owner_id: String,
    pub quota_limit: u32,
    pub quota_used: u32,
    pub duration_hours: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub status: InstanceStatus,
    pub last_sync: Option<DateTime<Utc>>,
}

impl FacadeInstance {
    /// Creates an active instance with zero quota used, expiring
    /// `duration_hours` after `created_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        name: impl Into<String>,
        facade_cred: impl Into<String>,
        master_cred: impl Into<String>,
        master_peer: impl Into<String>,
        owner_id: impl Into<String>,
        quota_limit: u32,
        duration_hours: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instance_id,
            name: name.into(),
            facade_cred: facade_cred.into(),
            master_cred: master_cred.into(),
            master_peer: master_peer.into(),
            owner_id: owner_id.into(),
            quota_limit,
            quota_used: 0,
            duration_hours,
            created_at,
            expires_at: expires_after_hours(created_at, duration_hours),
            active: true,
            status: InstanceStatus::Active,
            last_sync: None,
        }
    }

    /// Status as of `now`, ignoring whatever status was last persisted.
    pub fn status_at(&self, now: DateTime<Utc>) -> InstanceStatus {
        InstanceStatus::evaluate(self.expires_at, self.active, now)
    }

    /// Returns a copy whose `status` and `active` reflect `now`.
    pub fn evaluated_at(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.status_at(now);
        if self.status == InstanceStatus::Expired {
            self.active = false;
        }
        self
    }

    pub fn quota_remaining(&self) -> u32 {
        self.quota_limit.saturating_sub(self.quota_used)
    }

    pub fn has_quota(&self) -> bool {
        self.quota_used < self.quota_limit
    }

    /// Key identifying the master conversation this instance talks through.
    ///
    /// The conversation belongs to the listener account, so instances with
    /// different façade bots that share a listener session share the key.
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey {
            listener_cred: self.master_cred.clone(),
            master_peer: normalize_peer(&self.master_peer),
        }
    }
}

/// (listener credential, master peer) pair owning one master conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub listener_cred: String,
    /// Normalized with [`normalize_peer`].
    pub master_peer: String,
}

/// Canonical form of a peer reference: `@MasterBot` and `masterbot` are the
/// same account.
pub fn normalize_peer(peer: &str) -> String {
    peer.trim().trim_start_matches('@').to_lowercase()
}

/// How a catalog entry was recognized in a master reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    General,
    Parametric,
}

impl CommandCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Parametric => "parametric",
        }
    }

    pub fn parse(value: &str) -> Result<Self, UnknownVariantError> {
        match value {
            "general" => Ok(Self::General),
            "parametric" => Ok(Self::Parametric),
            _ => Err(UnknownVariantError {
                kind: "command_category",
                value: value.to_string(),
            }),
        }
    }
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command as recognized in reply text, before it is bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedCommand {
    /// Leading-slash form, e.g. `/location`.
    pub token: String,
    pub description: String,
    pub usage_template: Option<String>,
    pub category: CommandCategory,
    pub premium: bool,
}

impl ExtractedCommand {
    /// Binds the extracted command to an instance, stamped at `seen_at`.
    pub fn into_entry(self, instance_id: &InstanceId, seen_at: DateTime<Utc>) -> CommandEntry {
        CommandEntry {
            instance_id: instance_id.clone(),
            token: self.token,
            description: self.description,
            usage_template: self.usage_template,
            category: self.category,
            premium: self.premium,
            last_seen: seen_at,
        }
    }
}

/// One entry in a façade's persisted command catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEntry {
    pub instance_id: InstanceId,
    pub token: String,
    pub description: String,
    pub usage_template: Option<String>,
    pub category: CommandCategory,
    pub premium: bool,
    pub last_seen: DateTime<Utc>,
}

/// Status block as reported by the master, before it is bound to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedStatus {
    pub reported_name: String,
    pub reported_id: String,
    /// Free text; not necessarily a parseable date.
    pub expiry_text: String,
    pub status_text: String,
    pub premium: bool,
}

impl ExtractedStatus {
    pub fn into_snapshot(
        self,
        instance_id: &InstanceId,
        captured_at: DateTime<Utc>,
    ) -> MasterStatusSnapshot {
        MasterStatusSnapshot {
            instance_id: instance_id.clone(),
            reported_id: self.reported_id,
            reported_name: self.reported_name,
            expiry_text: self.expiry_text,
            status_text: self.status_text,
            premium: self.premium,
            captured_at,
        }
    }
}

/// Latest status block the master reported for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterStatusSnapshot {
    pub instance_id: InstanceId,
    pub reported_id: String,
    pub reported_name: String,
    pub expiry_text: String,
    pub status_text: String,
    pub premium: bool,
    pub captured_at: DateTime<Utc>,
}

/// Entry of a bot's static command menu (token without the leading slash).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

impl BotCommand {
    pub fn new(command: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            description: description.into(),
        }
    }
}
