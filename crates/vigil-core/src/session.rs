//! Capabilities consumed from the agent session runtime and the chat channels.
//!
//! The gateway never knows how a session or a platform connector works; it
//! only prompts, aborts, swaps models, reads [`SessionEvent`]s, and hands
//! plain text plus structural hints to a [`ChannelSender`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model_ref::ModelRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Lifecycle events emitted by the agent session.
pub enum SessionEvent {
    MessageStart,
    TextDelta {
        delta: String,
    },
    ToolCall {
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    ToolResult {
        #[serde(default)]
        name: String,
        #[serde(default)]
        is_error: bool,
    },
    TurnEnd,
    /// Error-bearing terminal event (rate limit, overload, provider failure).
    Error {
        message: String,
    },
    CompactionStart,
    CompactionEnd,
}

impl SessionEvent {
    /// True for events that end the current turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnEnd | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::TextDelta { .. } => "text_delta",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::TurnEnd => "turn_end",
            Self::Error { .. } => "error",
            Self::CompactionStart => "compaction_start",
            Self::CompactionEnd => "compaction_end",
        }
    }
}

/// Parses one NDJSON lifecycle line; blank or malformed lines yield `None`.
pub fn parse_session_event_line(line: &str) -> Option<SessionEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("agent session unavailable: {0}")]
    Unavailable(String),
    #[error("agent session rejected command: {0}")]
    Rejected(String),
    #[error("agent session did not acknowledge within {0}ms")]
    Timeout(u64),
    #[error("agent session transport error: {0}")]
    Transport(String),
}

/// Opaque conversational agent session.
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Submits a prompt; resolves once the session acknowledged it, not when the turn ends.
    async fn prompt(&self, text: &str) -> Result<(), SessionError>;
    /// Aborts the in-flight turn, if any.
    async fn abort(&self) -> Result<(), SessionError>;
    async fn set_model(&self, model: &ModelRef) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Structural hints for outbound delivery; connectors render them natively.
pub struct SendOptions {
    #[serde(default)]
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<String>,
}

impl SendOptions {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

/// Outbound delivery capability of a chat surface.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, target: &str, text: &str, options: &SendOptions) -> anyhow::Result<()>;
}

/// Priority side-channel to the human operator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_priority(&self, text: &str);
}
