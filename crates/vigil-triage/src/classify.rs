use serde::Serialize;
use vigil_core::GatewayMode;

use crate::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Forwarded to the agent on this wake.
    Immediate,
    /// Buffered for the next digest.
    Batched,
    /// Dropped after logging.
    Suppressed,
}

/// Static type -> tier map. Unknown types are treated as immediate.
pub fn classify(kind: &EventKind) -> Tier {
    match kind {
        EventKind::GatewaySleep
        | EventKind::GatewayWake
        | EventKind::OperatorMessage
        | EventKind::DeployFailed
        | EventKind::LoopCompleted
        | EventKind::LoopFailed
        | EventKind::AlertRaised
        | EventKind::ReminderDue
        | EventKind::Unknown(_) => Tier::Immediate,
        EventKind::DeploySucceeded
        | EventKind::MediaProcessed
        | EventKind::ContentSynced
        | EventKind::LoopStoryPassed
        | EventKind::MemoryObserved
        | EventKind::EmailReceived => Tier::Batched,
        EventKind::HeartbeatTick
        | EventKind::Progress
        | EventKind::LoopStoryStarted
        | EventKind::CacheRefreshed
        | EventKind::SystemPing => Tier::Suppressed,
    }
}

impl EventKind {
    /// Mode the event switches the gateway into, for the two mode-control types.
    pub fn mode_control(&self) -> Option<GatewayMode> {
        match self {
            EventKind::GatewaySleep => Some(GatewayMode::Sleep),
            EventKind::GatewayWake => Some(GatewayMode::Active),
            _ => None,
        }
    }
}
