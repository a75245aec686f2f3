//! Foundational types and utilities shared across vigil crates.
//!
//! Holds the inbound/session data model, the gateway mode flag, model
//! references, and the atomic file-write, clock and lock helpers used by the
//! runtime crates.

pub mod atomic_io;
pub mod inbound;
pub mod mode;
pub mod model_ref;
pub mod session;
pub mod sync;
pub mod time_utils;

pub use atomic_io::{read_json_if_exists, write_json_atomic, write_text_atomic};
pub use inbound::{InboundItem, LogRecord, DEFAULT_SOURCE};
pub use mode::GatewayMode;
pub use model_ref::{ModelRef, ModelRefParseError};
pub use session::{
    parse_session_event_line, AgentSession, ChannelSender, Notifier, SendOptions, SessionError,
    SessionEvent,
};
pub use sync::lock_or_recover;
pub use time_utils::current_unix_timestamp_ms;
