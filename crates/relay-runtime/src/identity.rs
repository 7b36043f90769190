//! Messaging collaborators consumed by the relay runtime.
//!
//! A listener identity is the account that talks to the master peer and can
//! wait for its next message; a bot identity is the façade users talk to.
//! In-memory implementations are provided for tests and local experimentation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use relay_types::{normalize_peer, BotCommand};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Errors reported by messaging collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("peer '{0}' is unreachable")]
    PeerUnreachable(String),
    #[error("no identity is configured for this credential")]
    IdentityUnavailable,
    #[error("reply subscription closed before a message arrived")]
    SubscriptionClosed,
    #[error("transport request failed: {0}")]
    Request(String),
}

/// Handle of a registered one-shot reply subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

/// Message received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: String,
    pub text: String,
}

/// One-shot subscription for the next message from a peer.
#[derive(Debug)]
pub struct ReplySubscription {
    pub handle: SubscriptionHandle,
    pub reply: oneshot::Receiver<InboundMessage>,
}

/// Identity of a bot as reported by its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotProfile {
    pub id: i64,
    pub username: Option<String>,
    pub display_name: String,
}

/// Account that sends commands to the master and awaits its replies.
#[async_trait]
pub trait ListenerIdentity: Send + Sync {
    async fn send_message(&self, peer: &str, text: &str) -> Result<(), TransportError>;

    /// Registers interest in the next message whose sender is `peer`.
    ///
    /// The subscription fires at most once. It stays registered until it
    /// fires or [`ListenerIdentity::unsubscribe`] is called.
    fn subscribe_next(&self, peer: &str) -> Result<ReplySubscription, TransportError>;

    /// Removes a subscription. Unknown or already-fired handles are ignored.
    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// User-facing façade bot.
#[async_trait]
pub trait BotIdentity: Send + Sync {
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), TransportError>;
    async fn set_command_menu(&self, commands: &[BotCommand]) -> Result<(), TransportError>;
    async fn get_self_info(&self) -> Result<BotProfile, TransportError>;
    async fn get_command_menu(&self) -> Result<Vec<BotCommand>, TransportError>;
}

/// Resolves collaborators for the credentials stored on an instance.
pub trait IdentityResolver: Send + Sync {
    fn listener(&self, credential: &str) -> Result<Arc<dyn ListenerIdentity>, TransportError>;
    fn bot(&self, credential: &str) -> Result<Arc<dyn BotIdentity>, TransportError>;
}

/// Returns true when two peer references name the same account
/// (`@MasterBot` and `masterbot` match).
pub fn peers_match(left: &str, right: &str) -> bool {
    normalize_peer(left) == normalize_peer(right)
}

/// Fixed credential-to-identity table.
#[derive(Default, Clone)]
pub struct StaticIdentities {
    listeners: HashMap<String, Arc<dyn ListenerIdentity>>,
    bots: HashMap<String, Arc<dyn BotIdentity>>,
}

impl StaticIdentities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener(
        mut self,
        credential: impl Into<String>,
        listener: Arc<dyn ListenerIdentity>,
    ) -> Self {
        self.listeners.insert(credential.into(), listener);
        self
    }

    pub fn with_bot(mut self, credential: impl Into<String>, bot: Arc<dyn BotIdentity>) -> Self {
        self.bots.insert(credential.into(), bot);
        self
    }
}

impl IdentityResolver for StaticIdentities {
    fn listener(&self, credential: &str) -> Result<Arc<dyn ListenerIdentity>, TransportError> {
        self.listeners
            .get(credential)
            .cloned()
            .ok_or(TransportError::IdentityUnavailable)
    }

    fn bot(&self, credential: &str) -> Result<Arc<dyn BotIdentity>, TransportError> {
        self.bots
            .get(credential)
            .cloned()
            .ok_or(TransportError::IdentityUnavailable)
    }
}

/// Message sent through an in-memory identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: String,
    pub text: String,
}

struct PendingSubscription {
    handle: SubscriptionHandle,
    peer: String,
    reply: oneshot::Sender<InboundMessage>,
}

#[derive(Default)]
struct ListenerState {
    subscriptions: Vec<PendingSubscription>,
    sent: Vec<OutboundMessage>,
    tap: Option<mpsc::UnboundedSender<OutboundMessage>>,
    unreachable: Vec<String>,
}

/// In-memory listener: records sends and lets tests inject peer messages.
#[derive(Default)]
pub struct InMemoryListener {
    state: Mutex<ListenerState>,
    next_handle: AtomicU64,
}

impl InMemoryListener {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Streams every message sent through this listener from now on.
    pub fn outbound(&self) -> mpsc::UnboundedReceiver<OutboundMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().tap = Some(tx);
        rx
    }

    /// Makes sends to `peer` fail as unreachable.
    pub fn mark_unreachable(&self, peer: &str) {
        self.state().unreachable.push(peer.to_string());
    }

    /// Delivers a message from `sender` to the oldest matching subscription.
    ///
    /// Returns false when no live subscription was waiting, in which case the
    /// message is dropped.
    pub fn deliver(&self, sender: &str, text: &str) -> bool {
        let mut state = self.state();
        while let Some(position) = state
            .subscriptions
            .iter()
            .position(|pending| peers_match(&pending.peer, sender))
        {
            let pending = state.subscriptions.remove(position);
            let message = InboundMessage {
                sender: sender.to_string(),
                text: text.to_string(),
            };
            if pending.reply.send(message).is_ok() {
                return true;
            }
        }
        false
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    pub fn active_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }
}

#[async_trait]
impl ListenerIdentity for InMemoryListener {
    async fn send_message(&self, peer: &str, text: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if state
            .unreachable
            .iter()
            .any(|unreachable| peers_match(unreachable, peer))
        {
            return Err(TransportError::PeerUnreachable(peer.to_string()));
        }
        let message = OutboundMessage {
            target: peer.to_string(),
            text: text.to_string(),
        };
        if let Some(tap) = &state.tap {
            let _ = tap.send(message.clone());
        }
        state.sent.push(message);
        Ok(())
    }

    fn subscribe_next(&self, peer: &str) -> Result<ReplySubscription, TransportError> {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.state().subscriptions.push(PendingSubscription {
            handle,
            peer: peer.to_string(),
            reply: tx,
        });
        Ok(ReplySubscription { handle, reply: rx })
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.state()
            .subscriptions
            .retain(|pending| pending.handle != handle);
    }
}

#[derive(Default)]
struct BotState {
    sent: Vec<OutboundMessage>,
    menu: Vec<BotCommand>,
    fail_sends: bool,
}

/// In-memory bot: records deliveries and the configured command menu.
pub struct InMemoryBot {
    profile: BotProfile,
    state: Mutex<BotState>,
}

impl InMemoryBot {
    pub fn new(profile: BotProfile) -> Self {
        Self {
            profile,
            state: Mutex::new(BotState::default()),
        }
    }

    /// Creates a bot whose menu already lists `commands`.
    pub fn with_menu(profile: BotProfile, commands: Vec<BotCommand>) -> Self {
        let bot = Self::new(profile);
        bot.state().menu = commands;
        bot
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes subsequent `send_message` calls fail.
    pub fn fail_sends(&self, fail: bool) {
        self.state().fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.state().sent.clone()
    }

    pub fn menu(&self) -> Vec<BotCommand> {
        self.state().menu.clone()
    }
}

#[async_trait]
impl BotIdentity for InMemoryBot {
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.fail_sends {
            return Err(TransportError::Request("send rejected".to_string()));
        }
        state.sent.push(OutboundMessage {
            target: destination.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn set_command_menu(&self, commands: &[BotCommand]) -> Result<(), TransportError> {
        self.state().menu = commands.to_vec();
        Ok(())
    }

    async fn get_self_info(&self) -> Result<BotProfile, TransportError> {
        Ok(self.profile.clone())
    }

    async fn get_command_menu(&self) -> Result<Vec<BotCommand>, TransportError> {
        Ok(self.state().menu.clone())
    }
}
