//! Reconnect/backoff state machine shared by every long-lived connector.
//!
//! A connector implements [`Connector`]; [`run_with_reconnect`] drives it
//! through `Disconnected -> Connecting -> Connected -> Disconnected` with
//! exponential backoff, an optional rate-limited [`SelfHeal`] hook, and
//! resubscription after every successful connect. [`PendingRequests`] fails
//! every outstanding correlation the moment a connection drops.

use thiserror::Error;

mod backoff;
mod connection;
mod correlation;
mod shutdown;

pub use backoff::BackoffPolicy;
pub use connection::{
    run_with_reconnect, ConnectionState, ConnectionSupervisor, Connector, SelfHeal,
    SelfHealPolicy,
};
pub use correlation::PendingRequests;
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection lost: {0}")]
    Disconnected(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("self-heal failed: {0}")]
    Heal(String),
}
