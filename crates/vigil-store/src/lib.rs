//! Durable state for the gateway: the inbound message log with consumer-group
//! semantics, the system event bus list, and the persisted gateway mode.
//!
//! Every contract ships with an in-memory backend for tests and a SQLite
//! backend ([`SqliteStore`]) that survives process restarts.

use thiserror::Error;

mod bus;
mod mode_store;
mod sqlite;
mod stream;

pub use bus::{EventBus, InMemoryEventBus};
pub use mode_store::{InMemoryModeStore, ModeStore};
pub use sqlite::SqliteStore;
pub use stream::{DurableLog, InMemoryDurableLog, StreamConfig, StreamId};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, LogError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("consumer group '{0}' already exists")]
    GroupExists(String),
    #[error("invalid stream id '{0}'")]
    InvalidStreamId(String),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
