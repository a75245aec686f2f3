use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source used when nothing identifies an originating channel.
pub const DEFAULT_SOURCE: &str = "gateway";

/// Fields stored for every durable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub source: String,
    pub prompt: String,
    #[serde(default)]
    pub metadata: Value,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One unit of work headed for the agent session.
///
/// `stream_id` is the durable log id and doubles as the ack token; it is
/// `None` when persisting failed and the item is delivered without a
/// durability guarantee.
pub struct InboundItem {
    pub source: String,
    pub prompt: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub stream_id: Option<String>,
}

impl InboundItem {
    pub fn new(source: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            prompt: prompt.into(),
            metadata: Value::Null,
            stream_id: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_stream_id(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    /// Channel portion of a `channel:conversation` source id.
    pub fn channel(&self) -> &str {
        source_channel(&self.source)
    }

    pub fn to_log_record(&self, timestamp_unix_ms: u64) -> LogRecord {
        LogRecord {
            source: self.source.clone(),
            prompt: self.prompt.clone(),
            metadata: self.metadata.clone(),
            timestamp_unix_ms,
        }
    }
}

/// Returns the channel name of an opaque `channel:conversation` source id.
pub fn source_channel(source: &str) -> &str {
    source
        .split_once(':')
        .map(|(channel, _)| channel)
        .unwrap_or(source)
        .trim()
}
