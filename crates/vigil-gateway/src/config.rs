use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vigil_core::ModelRef;
use vigil_resilience::{BackoffPolicy, SelfHealPolicy};
use vigil_runtime::{CommandQueueConfig, FallbackConfig, TripwireConfig, WatchdogConfig};
use vigil_store::StreamConfig;
use vigil_triage::TriageConfig;

use crate::cli::{Cli, RunArgs};

const DATABASE_FILE: &str = "vigil.sqlite";
const STATUS_FILE: &str = "status.json";
const TRIPWIRE_FILE: &str = "tripwire.json";

pub fn database_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DATABASE_FILE)
}

pub fn status_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATUS_FILE)
}

pub fn tripwire_path(state_dir: &Path) -> PathBuf {
    state_dir.join(TRIPWIRE_FILE)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealCommandConfig {
    pub argv: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProcessConfig {
    pub argv: Vec<String>,
    pub ack_timeout: Duration,
    /// Period of the "still waiting for the session" warning before replay.
    pub connect_timeout: Duration,
}

/// Fully typed runtime configuration of the `run` command.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub state_dir: PathBuf,
    pub bind: SocketAddr,
    pub session: SessionProcessConfig,
    pub primary_model: ModelRef,
    pub fallback: Option<FallbackConfig>,
    pub primary_health_url: Option<String>,
    pub operator_target: String,
    pub stream: StreamConfig,
    pub queue: CommandQueueConfig,
    pub watchdog: WatchdogConfig,
    pub tripwire: TripwireConfig,
    pub triage: TriageConfig,
    pub backoff: BackoffPolicy,
    pub self_heal: SelfHealPolicy,
    pub heal: Option<HealCommandConfig>,
    pub log_max_age: Duration,
    pub trim_interval: Duration,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        Self::from_run_args(&cli.state_dir, &cli.run)
    }

    pub fn from_run_args(state_dir: &Path, args: &RunArgs) -> Result<Self> {
        let bind: SocketAddr = args
            .bind
            .parse()
            .with_context(|| format!("invalid --bind '{}': expected host:port", args.bind))?;

        let Some(session_command) = args.session_command.as_deref() else {
            bail!("--session-command (VIGIL_SESSION_COMMAND) is required to run the gateway");
        };
        let session_argv = split_command(session_command, "--session-command")?;

        let primary_model = ModelRef::parse(&args.model)
            .with_context(|| format!("invalid --model '{}'", args.model))?;
        let fallback = match args.fallback_model.as_deref() {
            Some(raw) => {
                let fallback_model = ModelRef::parse(raw)
                    .with_context(|| format!("invalid --fallback-model '{raw}'"))?;
                if fallback_model == primary_model {
                    bail!("--fallback-model must differ from --model");
                }
                let mut config = FallbackConfig::new(primary_model.clone(), fallback_model);
                config.fallback_after_failures = args.fallback_after_failures;
                config.prompt_timeout = Duration::from_millis(args.prompt_timeout_ms);
                config.probe_interval = Duration::from_millis(args.recovery_probe_interval_ms);
                Some(config)
            }
            None => None,
        };

        let heal = match args.heal_command.as_deref() {
            Some(raw) => Some(HealCommandConfig {
                argv: split_command(raw, "--heal-command")?,
                timeout: Duration::from_millis(args.heal_timeout_ms),
            }),
            None => None,
        };

        if args.reconnect_base_ms > args.reconnect_max_ms {
            bail!("--reconnect-base-ms must not exceed --reconnect-max-ms");
        }

        let mut watchdog = WatchdogConfig::new(status_path(state_dir));
        watchdog.poll_interval = Duration::from_millis(args.watchdog_poll_ms);
        watchdog.stuck_threshold = Duration::from_millis(args.stuck_threshold_ms);
        watchdog.dead_threshold = args.dead_threshold;

        let mut tripwire = TripwireConfig::new(tripwire_path(state_dir));
        tripwire.interval = Duration::from_millis(args.tripwire_interval_ms);

        let triage = TriageConfig {
            seen_capacity: args.seen_capacity,
            wake_type: args.wake_event_type.trim().to_string(),
            poll_interval: Duration::from_millis(args.bus_poll_ms),
            digest_interval: Duration::from_millis(args.digest_interval_ms),
        };

        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            bind,
            session: SessionProcessConfig {
                argv: session_argv,
                ack_timeout: Duration::from_millis(args.session_ack_timeout_ms),
                connect_timeout: Duration::from_millis(args.session_connect_timeout_ms),
            },
            primary_model,
            fallback,
            primary_health_url: args
                .primary_health_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
            operator_target: args.operator_target.trim().to_string(),
            stream: StreamConfig::default(),
            queue: CommandQueueConfig {
                idle_timeout: Duration::from_millis(args.idle_timeout_ms),
                dedup_window: Duration::from_millis(args.dedup_window_ms),
                ..CommandQueueConfig::default()
            },
            watchdog,
            tripwire,
            triage,
            backoff: BackoffPolicy::new(
                Duration::from_millis(args.reconnect_base_ms),
                Duration::from_millis(args.reconnect_max_ms),
            ),
            self_heal: SelfHealPolicy {
                after_failures: args.heal_after_failures,
                min_interval: Duration::from_millis(args.heal_min_interval_ms),
            },
            heal,
            log_max_age: Duration::from_secs(args.log_max_age_hours.saturating_mul(3_600)),
            trim_interval: Duration::from_millis(args.trim_interval_ms),
            shutdown_grace: Duration::from_millis(args.shutdown_grace_ms),
        })
    }

    pub fn database_path(&self) -> PathBuf {
        database_path(&self.state_dir)
    }
}

fn split_command(raw: &str, flag: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(raw).with_context(|| format!("failed to parse {flag}"))?;
    if argv.is_empty() {
        bail!("{flag} cannot be empty");
    }
    Ok(argv)
}
