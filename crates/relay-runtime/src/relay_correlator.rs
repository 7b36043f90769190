//! One-shot request/reply correlation between a façade and its master.
//!
//! The master conversation is a single shared channel, so "the next message
//! from the master" is only a correct correlation when exactly one request is
//! in flight on it. The conversation belongs to the listener account, so
//! requests are serialized per (listener credential, master peer) pair through
//! a fair async mutex. Façade instances sharing a listener session queue
//! behind each other; waiters are served in FIFO order and distinct pairs
//! never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use relay_core::Clock;
use relay_store::{InstanceStore, StoreError};
use relay_types::{ConversationKey, FacadeInstance, InstanceId, InstanceStatus};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::identity::{IdentityResolver, ListenerIdentity, SubscriptionHandle, TransportError};

/// Default bound on how long a relay waits for the master.
pub const DEFAULT_RELAY_TIMEOUT: Duration = Duration::from_secs(30);

const USER_MESSAGE_TIMEOUT: &str = "The master did not respond in time. Please try again later.";
const USER_MESSAGE_NO_QUOTA: &str = "This façade instance has no remaining quota.";
const USER_MESSAGE_GENERIC: &str = "The command could not be processed right now.";

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors returned by the relay correlator.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("master did not reply within {0:?}")]
    Timeout(Duration),
    #[error("instance '{0}' has no remaining quota")]
    QuotaExceeded(InstanceId),
    #[error("instance '{instance_id}' is not available for relaying ({})", describe_status(.status))]
    InstanceUnavailable {
        instance_id: InstanceId,
        status: Option<InstanceStatus>,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(StoreError),
}

pub(crate) fn describe_status(status: &Option<InstanceStatus>) -> &'static str {
    status.map_or("not found", InstanceStatus::as_str)
}

impl From<StoreError> for RelayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::QuotaExceeded { instance_id, .. } => Self::QuotaExceeded(instance_id),
            StoreError::InstanceNotFound(instance_id) => Self::InstanceUnavailable {
                instance_id,
                status: None,
            },
            other => Self::Storage(other),
        }
    }
}

impl RelayError {
    /// Text shown to the requesting user. Never includes internal identifiers.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout(_) => USER_MESSAGE_TIMEOUT,
            Self::QuotaExceeded(_) => USER_MESSAGE_NO_QUOTA,
            _ => USER_MESSAGE_GENERIC,
        }
    }
}

/// Per-pair FIFO locks guarding master conversations.
#[derive(Debug, Default)]
pub struct ConversationLocks {
    locks: Mutex<HashMap<ConversationKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive use of the conversation identified by `key`.
    pub async fn acquire(&self, key: ConversationKey) -> ConversationTurn<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        ConversationTurn {
            guard: Some(guard),
            key,
            locks: self,
        }
    }

    /// Number of conversations with a holder or waiters.
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn release(&self, key: &ConversationKey) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(key);
        }
    }
}

/// Exclusive turn on one master conversation; released on drop.
pub struct ConversationTurn<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    key: ConversationKey,
    locks: &'a ConversationLocks,
}

impl Drop for ConversationTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.release(&self.key);
    }
}

struct SubscriptionGuard<'a> {
    listener: &'a dyn ListenerIdentity,
    handle: SubscriptionHandle,
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.listener.unsubscribe(self.handle);
    }
}

/// Sends `command` to `peer` and waits for the next message from `peer`.
///
/// The subscription is registered before the send so a fast reply cannot slip
/// past, and it is removed on every exit path including cancellation.
async fn exchange(
    listener: &dyn ListenerIdentity,
    peer: &str,
    command: &str,
    timeout: Duration,
) -> RelayResult<String> {
    let subscription = listener.subscribe_next(peer)?;
    let _registered = SubscriptionGuard {
        listener,
        handle: subscription.handle,
    };
    listener.send_message(peer, command).await?;

    match tokio::time::timeout(timeout, subscription.reply).await {
        Ok(Ok(message)) => Ok(message.text),
        Ok(Err(_)) => Err(TransportError::SubscriptionClosed.into()),
        Err(_) => Err(RelayError::Timeout(timeout)),
    }
}

/// Relays user commands to the master and correlates the single reply.
pub struct RelayCorrelator {
    store: Arc<dyn InstanceStore>,
    identities: Arc<dyn IdentityResolver>,
    clock: Arc<dyn Clock>,
    conversations: ConversationLocks,
}

impl RelayCorrelator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        identities: Arc<dyn IdentityResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            identities,
            clock,
            conversations: ConversationLocks::new(),
        }
    }

    pub fn conversations(&self) -> &ConversationLocks {
        &self.conversations
    }

    async fn load_usable(&self, instance_id: &InstanceId) -> RelayResult<FacadeInstance> {
        let instance = self
            .store
            .find_by_id(instance_id)
            .await?
            .ok_or_else(|| RelayError::InstanceUnavailable {
                instance_id: instance_id.clone(),
                status: None,
            })?;
        let status = instance.status_at(self.clock.now());
        if status != InstanceStatus::Active {
            return Err(RelayError::InstanceUnavailable {
                instance_id: instance_id.clone(),
                status: Some(status),
            });
        }
        Ok(instance)
    }

    /// Forwards `command` to the instance's master, delivers the correlated
    /// reply to `destination`, and charges one unit of quota.
    ///
    /// Refuses before sending when the instance is unavailable or out of
    /// quota. A timeout charges nothing.
    #[tracing::instrument(
        name = "relay.correlator.relay",
        skip_all,
        fields(instance_id = %instance_id, timeout_ms = timeout.as_millis() as u64)
    )]
    pub async fn relay(
        &self,
        instance_id: &InstanceId,
        command: &str,
        destination: &str,
        timeout: Duration,
    ) -> RelayResult<String> {
        let instance = self.load_usable(instance_id).await?;
        if !instance.has_quota() {
            return Err(RelayError::QuotaExceeded(instance_id.clone()));
        }

        let _turn = self
            .conversations
            .acquire(instance.conversation_key())
            .await;

        // Queued requests ahead of this one may have used the remaining quota
        // or outlived the instance.
        let instance = self.load_usable(instance_id).await?;
        if !instance.has_quota() {
            return Err(RelayError::QuotaExceeded(instance_id.clone()));
        }

        let listener = self.identities.listener(&instance.master_cred)?;
        let bot = self.identities.bot(&instance.facade_cred)?;

        let reply = match exchange(listener.as_ref(), &instance.master_peer, command, timeout).await
        {
            Ok(reply) => reply,
            Err(error) => {
                tracing::warn!(error = %error, "relay exchange failed");
                return Err(error);
            }
        };

        bot.send_message(destination, &reply).await?;
        let quota_used = self.store.increment_quota(instance_id).await?;
        tracing::debug!(quota_used, reply_chars = reply.chars().count(), "relay completed");
        Ok(reply)
    }

    /// Runs [`RelayCorrelator::relay`] and tells the user about failures.
    pub async fn handle_user_command(
        &self,
        instance_id: &InstanceId,
        command: &str,
        destination: &str,
        timeout: Duration,
    ) -> RelayResult<String> {
        let outcome = self.relay(instance_id, command, destination, timeout).await;
        if let Err(error) = &outcome {
            self.notify_user(instance_id, destination, error.user_message())
                .await;
        }
        outcome
    }

    async fn notify_user(&self, instance_id: &InstanceId, destination: &str, text: &str) {
        let bot = match self.store.find_by_id(instance_id).await {
            Ok(Some(instance)) => self.identities.bot(&instance.facade_cred),
            _ => return,
        };
        let sent = match bot {
            Ok(bot) => bot.send_message(destination, text).await,
            Err(error) => Err(error),
        };
        if let Err(error) = sent {
            tracing::warn!(instance_id = %instance_id, error = %error, "failed to notify user");
        }
    }

    /// Sends a probe command on the instance's master conversation and returns
    /// the reply without delivering it to anyone or charging quota.
    #[tracing::instrument(
        name = "relay.correlator.probe",
        skip_all,
        fields(instance_id = %instance.instance_id)
    )]
    pub async fn probe(
        &self,
        instance: &FacadeInstance,
        command: &str,
        timeout: Duration,
    ) -> RelayResult<String> {
        let _turn = self
            .conversations
            .acquire(instance.conversation_key())
            .await;
        let listener = self.identities.listener(&instance.master_cred)?;
        exchange(listener.as_ref(), &instance.master_peer, command, timeout).await
    }
}
