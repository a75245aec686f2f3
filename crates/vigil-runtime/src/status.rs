use std::path::Path;

use serde::{Deserialize, Serialize};
use vigil_core::{read_json_if_exists, GatewayMode};

use crate::{FallbackState, QueueSnapshot};

pub const STATUS_SCHEMA_VERSION: u32 = 1;

fn status_schema_version() -> u32 {
    STATUS_SCHEMA_VERSION
}

/// Snapshot written to `status.json` on every watchdog tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogReport {
    #[serde(default = "status_schema_version")]
    pub schema_version: u32,
    pub updated_unix_ms: u64,
    pub pid: u32,
    pub tick_count: u64,
    pub log_healthy: bool,
    pub bus_healthy: bool,
    #[serde(default)]
    pub bus_pending: usize,
    pub mode: GatewayMode,
    #[serde(default)]
    pub stuck_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub queue: QueueSnapshot,
    #[serde(default)]
    pub fallback: Option<FallbackState>,
    pub action: String,
}

/// Reads the last status snapshot, `None` when the gateway never wrote one.
pub fn inspect_status(path: &Path) -> anyhow::Result<Option<WatchdogReport>> {
    read_json_if_exists(path)
}
