//! Relay runtime: request/reply correlation between façade and master
//! identities, catalog synchronization, and façade instance lifecycle.
//!
//! Messaging transports are collaborators behind [`ListenerIdentity`] and
//! [`BotIdentity`]; the runtime resolves them per instance credential through
//! an [`IdentityResolver`] so tenants never share a hidden global client.

pub mod identity;
pub mod instance_lifecycle;
pub mod relay_correlator;
pub mod sync_orchestrator;

pub use identity::*;
pub use instance_lifecycle::*;
pub use relay_correlator::*;
pub use sync_orchestrator::*;
