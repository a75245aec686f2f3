use std::fmt;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the system event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub ts: u64,
}

impl SystemEvent {
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Pre-built text meant for the operator as-is, bypassing the agent.
    pub fn direct_message(&self) -> Option<&str> {
        self.payload_str("direct_message")
    }

    /// Literal message, falling back to a generic description.
    pub fn message_text(&self) -> Option<&str> {
        self.payload_str("message")
            .or_else(|| self.payload_str("description"))
    }

    /// Originating channel source (`telegram:123`) when the producer knows it.
    pub fn origin(&self) -> Option<&str> {
        self.payload_str("origin")
    }
}

/// Parses a raw bus payload. Anything that is not an object with non-empty
/// string `id` and `type` fields is malformed and yields `None`.
pub fn parse_system_event(raw: &str) -> Option<SystemEvent> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let object = value.as_object()?;
    let id = non_empty_str(object.get("id")?)?;
    let event_type = non_empty_str(object.get("type")?)?;
    let source = object
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    let payload = object.get("payload").cloned().unwrap_or(Value::Null);
    let ts = object.get("ts").map(parse_timestamp_ms).unwrap_or_default();
    Some(SystemEvent {
        id,
        event_type,
        source,
        payload,
        ts,
    })
}

fn non_empty_str(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Accepts unix milliseconds, unix seconds, or an RFC 3339 string.
fn parse_timestamp_ms(value: &Value) -> u64 {
    match value {
        Value::Number(number) => {
            let raw = number
                .as_u64()
                .or_else(|| number.as_f64().filter(|v| *v >= 0.0).map(|v| v as u64))
                .unwrap_or_default();
            if raw < 100_000_000_000 {
                raw.saturating_mul(1_000)
            } else {
                raw
            }
        }
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .and_then(|parsed| u64::try_from(parsed.timestamp_millis()).ok())
            .unwrap_or_default(),
        _ => 0,
    }
}

/// Closed set of known event types plus a catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    GatewaySleep,
    GatewayWake,
    OperatorMessage,
    DeployFailed,
    LoopCompleted,
    LoopFailed,
    AlertRaised,
    ReminderDue,
    DeploySucceeded,
    MediaProcessed,
    ContentSynced,
    LoopStoryPassed,
    MemoryObserved,
    EmailReceived,
    HeartbeatTick,
    Progress,
    LoopStoryStarted,
    CacheRefreshed,
    SystemPing,
    Unknown(String),
}

impl EventKind {
    pub const KNOWN: [EventKind; 19] = [
        EventKind::GatewaySleep,
        EventKind::GatewayWake,
        EventKind::OperatorMessage,
        EventKind::DeployFailed,
        EventKind::LoopCompleted,
        EventKind::LoopFailed,
        EventKind::AlertRaised,
        EventKind::ReminderDue,
        EventKind::DeploySucceeded,
        EventKind::MediaProcessed,
        EventKind::ContentSynced,
        EventKind::LoopStoryPassed,
        EventKind::MemoryObserved,
        EventKind::EmailReceived,
        EventKind::HeartbeatTick,
        EventKind::Progress,
        EventKind::LoopStoryStarted,
        EventKind::CacheRefreshed,
        EventKind::SystemPing,
    ];

    pub fn from_type(event_type: &str) -> Self {
        match event_type.trim() {
            "gateway.sleep" => Self::GatewaySleep,
            "gateway.wake" => Self::GatewayWake,
            "operator.message" => Self::OperatorMessage,
            "deploy.failed" => Self::DeployFailed,
            "loop.completed" => Self::LoopCompleted,
            "loop.failed" => Self::LoopFailed,
            "alert.raised" => Self::AlertRaised,
            "reminder.due" => Self::ReminderDue,
            "deploy.succeeded" => Self::DeploySucceeded,
            "media.processed" => Self::MediaProcessed,
            "content.synced" => Self::ContentSynced,
            "loop.story.passed" => Self::LoopStoryPassed,
            "memory.observed" => Self::MemoryObserved,
            "email.received" => Self::EmailReceived,
            "heartbeat.tick" => Self::HeartbeatTick,
            "progress" => Self::Progress,
            "loop.story.started" => Self::LoopStoryStarted,
            "cache.refreshed" => Self::CacheRefreshed,
            "system.ping" => Self::SystemPing,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::GatewaySleep => "gateway.sleep",
            Self::GatewayWake => "gateway.wake",
            Self::OperatorMessage => "operator.message",
            Self::DeployFailed => "deploy.failed",
            Self::LoopCompleted => "loop.completed",
            Self::LoopFailed => "loop.failed",
            Self::AlertRaised => "alert.raised",
            Self::ReminderDue => "reminder.due",
            Self::DeploySucceeded => "deploy.succeeded",
            Self::MediaProcessed => "media.processed",
            Self::ContentSynced => "content.synced",
            Self::LoopStoryPassed => "loop.story.passed",
            Self::MemoryObserved => "memory.observed",
            Self::EmailReceived => "email.received",
            Self::HeartbeatTick => "heartbeat.tick",
            Self::Progress => "progress",
            Self::LoopStoryStarted => "loop.story.started",
            Self::CacheRefreshed => "cache.refreshed",
            Self::SystemPing => "system.ping",
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_system_event, EventKind};

    #[test]
    fn unit_known_kinds_round_trip_through_type_strings() {
        for kind in EventKind::KNOWN {
            assert_eq!(EventKind::from_type(kind.as_str()), kind);
        }
        assert_eq!(
            EventKind::from_type("brand.new"),
            EventKind::Unknown("brand.new".to_string())
        );
    }

    #[test]
    fn functional_parse_accepts_full_and_minimal_payloads() {
        let event = parse_system_event(
            r#"{"id":"e1","type":"deploy.failed","source":"ci","payload":{"message":"build 12 failed","origin":"slack:C1"},"ts":1700000000}"#,
        )
        .expect("full event");
        assert_eq!(event.kind(), EventKind::DeployFailed);
        assert_eq!(event.ts, 1_700_000_000_000);
        assert_eq!(event.message_text(), Some("build 12 failed"));
        assert_eq!(event.origin(), Some("slack:C1"));

        let minimal = parse_system_event(r#"{"id":7,"type":"progress"}"#).expect("minimal");
        assert_eq!(minimal.id, "7");
        assert_eq!(minimal.source, "");
        assert_eq!(minimal.ts, 0);

        let dated = parse_system_event(
            r#"{"id":"e2","type":"x","ts":"2024-01-01T00:00:00Z","payload":{"description":"d"}}"#,
        )
        .expect("dated");
        assert_eq!(dated.ts, 1_704_067_200_000);
        assert_eq!(dated.message_text(), Some("d"));
    }

    #[test]
    fn regression_malformed_payloads_are_rejected() {
        for raw in [
            "",
            "not json",
            "[1,2]",
            r#"{"type":"progress"}"#,
            r#"{"id":"e1"}"#,
            r#"{"id":"","type":"progress"}"#,
            r#"{"id":"e1","type":null}"#,
        ] {
            assert!(parse_system_event(raw).is_none(), "accepted {raw:?}");
        }
    }

    #[test]
    fn unit_message_takes_precedence_over_description() {
        let event = parse_system_event(
            r#"{"id":"e","type":"alert.raised","payload":{"description":"generic","message":"disk full"}}"#,
        )
        .expect("event");
        assert_eq!(event.message_text(), Some("disk full"));
    }
}
