use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u32(value: &str) -> Result<u32, String> {
    let parsed = value
        .parse::<u32>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "vigil",
    about = "Reliability core for a single-session assistant gateway",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "VIGIL_STATE_DIR",
        default_value = ".vigil",
        global = true,
        help = "Directory holding the SQLite store, status.json and tripwire.json"
    )]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Option<CliCommand>,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Run the gateway (default when no subcommand is given).
    Run,
    /// Print the last watchdog status snapshot and tripwire heartbeat.
    Status {
        #[arg(long, help = "Emit raw JSON instead of a summary")]
        json: bool,
    },
    /// List unacknowledged log entries without claiming them.
    ReplayPreview {
        #[arg(long, help = "Emit raw JSON instead of a summary")]
        json: bool,
    },
}

#[derive(Debug, Clone, clap::Args)]
pub struct RunArgs {
    #[arg(
        long,
        env = "VIGIL_BIND",
        default_value = "127.0.0.1:8790",
        help = "host:port for the HTTP ingress"
    )]
    pub bind: String,

    #[arg(
        long,
        env = "VIGIL_SESSION_COMMAND",
        help = "Shell-quoted command that starts the agent session process (NDJSON over stdio)"
    )]
    pub session_command: Option<String>,

    #[arg(
        long,
        env = "VIGIL_SESSION_ACK_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Upper bound on waiting for the session to acknowledge a command"
    )]
    pub session_ack_timeout_ms: u64,

    #[arg(
        long,
        env = "VIGIL_SESSION_CONNECT_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "How long startup replay waits for the session before logging and waiting again"
    )]
    pub session_connect_timeout_ms: u64,

    #[arg(
        long,
        env = "VIGIL_MODEL",
        default_value = "anthropic/claude-sonnet-4",
        help = "Primary model in provider/model format"
    )]
    pub model: String,

    #[arg(
        long = "fallback-model",
        env = "VIGIL_FALLBACK_MODEL",
        help = "Fallback model in provider/model format; enables automatic model fallback"
    )]
    pub fallback_model: Option<String>,

    #[arg(
        long,
        env = "VIGIL_PRIMARY_HEALTH_URL",
        help = "Health URL probed before restoring the primary model (2xx = healthy)"
    )]
    pub primary_health_url: Option<String>,

    #[arg(
        long,
        env = "VIGIL_FALLBACK_AFTER_FAILURES",
        default_value_t = 3,
        value_parser = parse_positive_u32
    )]
    pub fallback_after_failures: u32,

    #[arg(
        long,
        env = "VIGIL_PROMPT_TIMEOUT_MS",
        default_value_t = 120_000,
        value_parser = parse_positive_u64,
        help = "Silence after a prompt that switches to the fallback model"
    )]
    pub prompt_timeout_ms: u64,

    #[arg(
        long,
        env = "VIGIL_RECOVERY_PROBE_INTERVAL_MS",
        default_value_t = 600_000,
        value_parser = parse_positive_u64
    )]
    pub recovery_probe_interval_ms: u64,

    #[arg(
        long,
        env = "VIGIL_IDLE_TIMEOUT_MS",
        default_value_t = 300_000,
        value_parser = parse_positive_u64,
        help = "Safety timeout on waiting for the session to become idle"
    )]
    pub idle_timeout_ms: u64,

    #[arg(
        long,
        env = "VIGIL_DEDUP_WINDOW_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64
    )]
    pub dedup_window_ms: u64,

    #[arg(
        long,
        env = "VIGIL_WATCHDOG_POLL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64
    )]
    pub watchdog_poll_ms: u64,

    #[arg(
        long,
        env = "VIGIL_STUCK_THRESHOLD_MS",
        default_value_t = 600_000,
        value_parser = parse_positive_u64
    )]
    pub stuck_threshold_ms: u64,

    #[arg(
        long,
        env = "VIGIL_DEAD_THRESHOLD",
        default_value_t = 3,
        value_parser = parse_positive_u32,
        help = "Consecutive prompt failures that trigger a supervised restart"
    )]
    pub dead_threshold: u32,

    #[arg(
        long,
        env = "VIGIL_TRIPWIRE_INTERVAL_MS",
        default_value_t = 900_000,
        value_parser = parse_positive_u64
    )]
    pub tripwire_interval_ms: u64,

    #[arg(
        long,
        env = "VIGIL_BUS_POLL_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64
    )]
    pub bus_poll_ms: u64,

    #[arg(
        long,
        env = "VIGIL_DIGEST_INTERVAL_MS",
        default_value_t = 3_600_000,
        value_parser = parse_positive_u64
    )]
    pub digest_interval_ms: u64,

    #[arg(
        long,
        env = "VIGIL_SEEN_CAPACITY",
        default_value_t = 500,
        value_parser = parse_positive_usize
    )]
    pub seen_capacity: usize,

    #[arg(
        long,
        env = "VIGIL_WAKE_EVENT_TYPE",
        default_value = "operator.message",
        help = "Only event type that passes triage while the gateway sleeps"
    )]
    pub wake_event_type: String,

    #[arg(
        long,
        env = "VIGIL_OPERATOR_TARGET",
        default_value = "operator",
        help = "Channel target for priority notifications"
    )]
    pub operator_target: String,

    #[arg(
        long,
        env = "VIGIL_LOG_MAX_AGE_HOURS",
        default_value_t = 168,
        value_parser = parse_positive_u64
    )]
    pub log_max_age_hours: u64,

    #[arg(
        long,
        env = "VIGIL_TRIM_INTERVAL_MS",
        default_value_t = 86_400_000,
        value_parser = parse_positive_u64
    )]
    pub trim_interval_ms: u64,

    #[arg(
        long,
        env = "VIGIL_SHUTDOWN_GRACE_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "How long shutdown waits for the in-flight turn to finish"
    )]
    pub shutdown_grace_ms: u64,

    #[arg(
        long,
        env = "VIGIL_RECONNECT_BASE_MS",
        default_value_t = 1_000,
        value_parser = parse_positive_u64
    )]
    pub reconnect_base_ms: u64,

    #[arg(
        long,
        env = "VIGIL_RECONNECT_MAX_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64
    )]
    pub reconnect_max_ms: u64,

    #[arg(
        long,
        env = "VIGIL_HEAL_COMMAND",
        help = "Shell-quoted command run as the connector self-heal hook"
    )]
    pub heal_command: Option<String>,

    #[arg(
        long,
        env = "VIGIL_HEAL_TIMEOUT_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64
    )]
    pub heal_timeout_ms: u64,

    #[arg(
        long,
        env = "VIGIL_HEAL_AFTER_FAILURES",
        default_value_t = 5,
        value_parser = parse_positive_u32
    )]
    pub heal_after_failures: u32,

    #[arg(
        long,
        env = "VIGIL_HEAL_MIN_INTERVAL_MS",
        default_value_t = 300_000,
        value_parser = parse_positive_u64
    )]
    pub heal_min_interval_ms: u64,
}
