use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};
use vigil_core::{current_unix_timestamp_ms, write_json_atomic, AgentSession, Notifier};
use vigil_resilience::ShutdownSignal;
use vigil_store::{DurableLog, EventBus, ModeStore};

use crate::{CommandQueue, FallbackController, WatchdogReport, STATUS_SCHEMA_VERSION};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_STUCK_THRESHOLD: Duration = Duration::from_secs(10 * 60);
const DEFAULT_DEAD_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub stuck_threshold: Duration,
    /// Consecutive failures after which the session is considered dead.
    pub dead_threshold: u32,
    pub status_path: PathBuf,
}

impl WatchdogConfig {
    pub fn new(status_path: impl Into<PathBuf>) -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            dead_threshold: DEFAULT_DEAD_THRESHOLD,
            status_path: status_path.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Healthy,
    AbortedStuckTurn { stuck_ms: u64 },
    ShutdownRequested { failures: u32 },
    /// Dead threshold still exceeded but shutdown was already requested.
    ShutdownPending,
}

impl WatchdogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::AbortedStuckTurn { .. } => "aborted_stuck_turn",
            Self::ShutdownRequested { .. } => "shutdown_requested",
            Self::ShutdownPending => "shutdown_pending",
        }
    }
}

/// Process-level restart request; the supervisor brings the gateway back.
#[async_trait]
pub trait GracefulShutdown: Send + Sync {
    async fn shutdown(&self, reason: &str);
}

pub struct Watchdog {
    config: WatchdogConfig,
    queue: CommandQueue,
    session: Arc<dyn AgentSession>,
    log: Arc<dyn DurableLog>,
    bus: Arc<dyn EventBus>,
    modes: Arc<dyn ModeStore>,
    notifier: Arc<dyn Notifier>,
    shutdown: Arc<dyn GracefulShutdown>,
    fallback: Option<FallbackController>,
    shutdown_latched: AtomicBool,
    tick_count: AtomicU64,
}

impl Watchdog {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WatchdogConfig,
        queue: CommandQueue,
        session: Arc<dyn AgentSession>,
        log: Arc<dyn DurableLog>,
        bus: Arc<dyn EventBus>,
        modes: Arc<dyn ModeStore>,
        notifier: Arc<dyn Notifier>,
        shutdown: Arc<dyn GracefulShutdown>,
    ) -> Self {
        Self {
            config,
            queue,
            session,
            log,
            bus,
            modes,
            notifier,
            shutdown,
            fallback: None,
            shutdown_latched: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn with_fallback(mut self, fallback: FallbackController) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Polls on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(current_unix_timestamp_ms()).await;
                }
                _ = shutdown.wait() => break,
            }
        }
        info!("watchdog stopped");
    }

    /// One poll: health checks, stuck detection, dead-session handling, status file.
    pub async fn tick(&self, now_unix_ms: u64) -> WatchdogReport {
        let tick_count = self.tick_count.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let log_healthy = match self.log.ping().await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "durable log unreachable");
                false
            }
        };
        let (bus_healthy, bus_pending) = match self.bus.pending_len().await {
            Ok(pending) => (true, pending),
            Err(error) => {
                warn!(error = %error, "event bus unreachable");
                (false, 0)
            }
        };
        let mode = self.modes.load_mode().await.unwrap_or_else(|error| {
            warn!(error = %error, "failed to read gateway mode");
            Default::default()
        });

        let failures = self.queue.failures().current();
        let turn_clock = self.queue.turn_clock();
        let stuck_ms = turn_clock.stuck_for_ms(now_unix_ms);
        let stuck_threshold_ms =
            u64::try_from(self.config.stuck_threshold.as_millis()).unwrap_or(u64::MAX);

        let action = if failures >= self.config.dead_threshold {
            self.request_shutdown(failures).await
        } else if let Some(stuck) = stuck_ms.filter(|stuck| *stuck > stuck_threshold_ms) {
            warn!(stuck_ms = stuck, "aborting stuck agent turn");
            if let Err(error) = self.session.abort().await {
                warn!(error = %error, "abort of stuck turn failed");
            }
            turn_clock.mark_completion(now_unix_ms);
            WatchdogAction::AbortedStuckTurn { stuck_ms: stuck }
        } else {
            WatchdogAction::Healthy
        };

        let report = WatchdogReport {
            schema_version: STATUS_SCHEMA_VERSION,
            updated_unix_ms: now_unix_ms,
            pid: std::process::id(),
            tick_count,
            log_healthy,
            bus_healthy,
            bus_pending,
            mode,
            stuck_ms,
            consecutive_failures: failures,
            queue: self.queue.snapshot(),
            fallback: self.fallback.as_ref().map(FallbackController::state),
            action: action.as_str().to_string(),
        };
        if let Err(error) = write_json_atomic(&self.config.status_path, &report) {
            warn!(
                path = %self.config.status_path.display(),
                error = %error,
                "failed to write status snapshot"
            );
        }
        report
    }

    async fn request_shutdown(&self, failures: u32) -> WatchdogAction {
        if self.shutdown_latched.swap(true, Ordering::SeqCst) {
            return WatchdogAction::ShutdownPending;
        }
        error!(
            failures,
            "agent session is dead; requesting graceful shutdown for supervised restart"
        );
        self.notifier
            .notify_priority(&format!(
                "Agent session failed {failures} times in a row; restarting the gateway. Queued messages will be replayed."
            ))
            .await;
        self.shutdown
            .shutdown(&format!("{failures} consecutive prompt failures"))
            .await;
        WatchdogAction::ShutdownRequested { failures }
    }
}

#[cfg(test)]
mod tests {
    use super::{GracefulShutdown, Watchdog, WatchdogAction, WatchdogConfig};
    use crate::fallback::tests::{ModelRecorder, NotifyRecorder};
    use crate::{inspect_status, CommandQueue, CommandQueueConfig, IdleGate, TurnObserver};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;
    use vigil_store::{InMemoryDurableLog, InMemoryEventBus, InMemoryModeStore};

    struct NoHooks;

    impl TurnObserver for NoHooks {}

    #[derive(Default)]
    struct ShutdownRecorder(Mutex<Vec<String>>);

    #[async_trait]
    impl GracefulShutdown for ShutdownRecorder {
        async fn shutdown(&self, reason: &str) {
            self.0.lock().expect("reasons").push(reason.to_string());
        }
    }

    struct Harness {
        queue: CommandQueue,
        session: Arc<ModelRecorder>,
        notes: Arc<NotifyRecorder>,
        shutdowns: Arc<ShutdownRecorder>,
        watchdog: Watchdog,
        _temp: tempfile::TempDir,
        status_path: std::path::PathBuf,
    }

    fn harness() -> Harness {
        let temp = tempdir().expect("tempdir");
        let status_path = temp.path().join("status.json");
        let session = Arc::new(ModelRecorder::default());
        let log = Arc::new(InMemoryDurableLog::new());
        let queue = CommandQueue::new(
            CommandQueueConfig::default(),
            log.clone(),
            session.clone(),
            Arc::new(NoHooks),
            Arc::new(IdleGate::new()),
        );
        let notes = Arc::new(NotifyRecorder::default());
        let shutdowns = Arc::new(ShutdownRecorder::default());
        let watchdog = Watchdog::new(
            WatchdogConfig::new(&status_path),
            queue.clone(),
            session.clone(),
            log,
            Arc::new(InMemoryEventBus::new()),
            Arc::new(InMemoryModeStore::new()),
            notes.clone(),
            shutdowns.clone(),
        );
        Harness {
            queue,
            session,
            notes,
            shutdowns,
            watchdog,
            _temp: temp,
            status_path,
        }
    }

    #[tokio::test]
    async fn integration_three_failures_trigger_exactly_one_shutdown() {
        let h = harness();
        let failures = h.queue.failures();
        for _ in 0..3 {
            failures.record_failure();
        }
        let first = h.watchdog.tick(10_000).await;
        let second = h.watchdog.tick(40_000).await;
        assert_eq!(first.action, "shutdown_requested");
        assert_eq!(second.action, "shutdown_pending");
        assert_eq!(h.shutdowns.0.lock().expect("reasons").len(), 1);
        assert_eq!(h.notes.0.lock().expect("notes").len(), 1);

        let persisted = inspect_status(&h.status_path)
            .expect("read status")
            .expect("status written");
        assert_eq!(persisted.tick_count, 2);
        assert_eq!(persisted.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn regression_intervening_success_prevents_dead_trigger() {
        let h = harness();
        let failures = h.queue.failures();
        failures.record_failure();
        failures.record_failure();
        failures.record_success();
        failures.record_failure();
        let report = h.watchdog.tick(10_000).await;
        assert_eq!(report.action, WatchdogAction::Healthy.as_str());
        assert!(h.shutdowns.0.lock().expect("reasons").is_empty());
    }

    #[tokio::test]
    async fn functional_stuck_turn_is_aborted_and_timer_reset() {
        let h = harness();
        let clock = h.queue.turn_clock();
        clock.mark_dispatch(1_000);

        let slow = h.watchdog.tick(1_000 + 9 * 60 * 1_000).await;
        assert_eq!(slow.action, "healthy");
        assert_eq!(slow.stuck_ms, Some(9 * 60 * 1_000));

        let stuck = h.watchdog.tick(1_000 + 10 * 60 * 1_000 + 1).await;
        assert_eq!(stuck.action, "aborted_stuck_turn");
        assert_eq!(*h.session.aborts.lock().expect("aborts"), 1);
        assert_eq!(clock.stuck_for_ms(2_000_000), None);
        assert!(stuck.log_healthy && stuck.bus_healthy);
    }

    #[tokio::test]
    async fn regression_turn_at_exactly_the_stuck_threshold_is_left_running() {
        let h = harness();
        h.queue.turn_clock().mark_dispatch(5_000);

        let report = h.watchdog.tick(5_000 + 10 * 60 * 1_000).await;
        assert_eq!(report.action, "healthy");
        assert_eq!(report.stuck_ms, Some(10 * 60 * 1_000));
        assert_eq!(*h.session.aborts.lock().expect("aborts"), 0);
    }
}
