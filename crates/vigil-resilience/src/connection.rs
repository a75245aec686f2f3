use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{BackoffPolicy, ConnectionError, ShutdownSignal};

const DEFAULT_SELF_HEAL_AFTER_FAILURES: u32 = 5;
const DEFAULT_SELF_HEAL_MIN_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When the self-heal hook may run: after `after_failures` consecutive
/// failures, and never twice within `min_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfHealPolicy {
    pub after_failures: u32,
    pub min_interval: Duration,
}

impl Default for SelfHealPolicy {
    fn default() -> Self {
        Self {
            after_failures: DEFAULT_SELF_HEAL_AFTER_FAILURES,
            min_interval: DEFAULT_SELF_HEAL_MIN_INTERVAL,
        }
    }
}

/// Hook that restarts an upstream dependency before the next reconnect attempt.
#[async_trait]
pub trait SelfHeal: Send + Sync {
    async fn heal(&self, connector: &str) -> Result<(), ConnectionError>;
}

/// Per-connector connection state and retry bookkeeping.
#[derive(Debug, Clone)]
pub struct ConnectionSupervisor {
    name: String,
    backoff: BackoffPolicy,
    self_heal: SelfHealPolicy,
    state: ConnectionState,
    consecutive_failures: u32,
    connect_count: u64,
    last_self_heal: Option<Instant>,
}

impl ConnectionSupervisor {
    pub fn new(name: impl Into<String>, backoff: BackoffPolicy, self_heal: SelfHealPolicy) -> Self {
        Self {
            name: name.into(),
            backoff,
            self_heal,
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            connect_count: 0,
            last_self_heal: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn connect_count(&self) -> u64 {
        self.connect_count
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Connected and resubscribed: backoff returns to its base delay.
    pub fn record_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.consecutive_failures = 0;
        self.connect_count = self.connect_count.saturating_add(1);
    }

    /// Clean close by the remote end; not counted as a failure.
    pub fn record_closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    pub fn record_failure(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Delay before the next connect attempt.
    pub fn next_delay(&self) -> Duration {
        self.backoff
            .delay_for(self.consecutive_failures.saturating_sub(1))
    }

    pub fn should_self_heal(&self, now: Instant) -> bool {
        if self.self_heal.after_failures == 0
            || self.consecutive_failures < self.self_heal.after_failures
        {
            return false;
        }
        match self.last_self_heal {
            Some(last) => now.saturating_duration_since(last) >= self.self_heal.min_interval,
            None => true,
        }
    }

    pub fn mark_self_heal(&mut self, now: Instant) {
        self.last_self_heal = Some(now);
    }
}

/// A long-lived external connection (bus listener, child-process session, socket client).
#[async_trait]
pub trait Connector: Send {
    type Link: Send;

    async fn connect(&mut self) -> Result<Self::Link, ConnectionError>;
    /// Re-handshake after every successful connect; the link is unusable until it succeeds.
    async fn resubscribe(&mut self, link: &mut Self::Link) -> Result<(), ConnectionError>;
    /// Serves the link until it closes (`Ok`) or breaks (`Err`).
    async fn serve(&mut self, link: Self::Link) -> Result<(), ConnectionError>;
}

/// Drives `connector` until `shutdown` fires, reconnecting with backoff.
pub async fn run_with_reconnect<C>(
    connector: &mut C,
    supervisor: &mut ConnectionSupervisor,
    self_heal: Option<&dyn SelfHeal>,
    mut shutdown: ShutdownSignal,
) where
    C: Connector,
{
    while !shutdown.is_triggered() {
        supervisor.begin_connect();
        let established = match connector.connect().await {
            Ok(mut link) => match connector.resubscribe(&mut link).await {
                Ok(()) => Ok(link),
                Err(error) => Err(error),
            },
            Err(error) => Err(error),
        };

        match established {
            Ok(link) => {
                supervisor.record_connected();
                info!(
                    connector = supervisor.name(),
                    connects = supervisor.connect_count(),
                    "connector connected"
                );
                let outcome = tokio::select! {
                    outcome = connector.serve(link) => outcome,
                    _ = shutdown.wait() => {
                        supervisor.record_closed();
                        break;
                    }
                };
                match outcome {
                    Ok(()) => {
                        supervisor.record_closed();
                        info!(connector = supervisor.name(), "connector closed");
                    }
                    Err(error) => {
                        supervisor.record_failure();
                        warn!(
                            connector = supervisor.name(),
                            failures = supervisor.consecutive_failures(),
                            error = %error,
                            "connector dropped"
                        );
                    }
                }
            }
            Err(error) => {
                supervisor.record_failure();
                warn!(
                    connector = supervisor.name(),
                    failures = supervisor.consecutive_failures(),
                    error = %error,
                    "connector failed to connect"
                );
            }
        }

        if let Some(hook) = self_heal {
            let now = Instant::now();
            if supervisor.should_self_heal(now) {
                supervisor.mark_self_heal(now);
                match hook.heal(supervisor.name()).await {
                    Ok(()) => info!(connector = supervisor.name(), "self-heal hook completed"),
                    Err(error) => warn!(
                        connector = supervisor.name(),
                        error = %error,
                        "self-heal hook failed"
                    ),
                }
            }
        }

        let delay = supervisor.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait() => break,
        }
    }
    supervisor.record_closed();
}

#[cfg(test)]
mod tests {
    use super::{
        run_with_reconnect, ConnectionState, ConnectionSupervisor, Connector, SelfHeal,
        SelfHealPolicy,
    };
    use crate::{shutdown_channel, BackoffPolicy, ConnectionError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn supervisor(after_failures: u32) -> ConnectionSupervisor {
        ConnectionSupervisor::new(
            "test",
            BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
            SelfHealPolicy {
                after_failures,
                min_interval: Duration::from_secs(60),
            },
        )
    }

    #[test]
    fn unit_failures_grow_backoff_and_success_resets_it() {
        let mut supervisor = supervisor(3);
        assert_eq!(supervisor.next_delay(), Duration::from_millis(100));
        supervisor.record_failure();
        supervisor.record_failure();
        supervisor.record_failure();
        assert_eq!(supervisor.next_delay(), Duration::from_millis(400));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        supervisor.begin_connect();
        assert_eq!(supervisor.state(), ConnectionState::Connecting);
        supervisor.record_connected();
        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(supervisor.consecutive_failures(), 0);
        assert_eq!(supervisor.next_delay(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn unit_self_heal_is_rate_limited() {
        let mut supervisor = supervisor(2);
        let start = Instant::now();
        supervisor.record_failure();
        assert!(!supervisor.should_self_heal(start));
        supervisor.record_failure();
        assert!(supervisor.should_self_heal(start));
        supervisor.mark_self_heal(start);
        supervisor.record_failure();
        assert!(!supervisor.should_self_heal(start + Duration::from_secs(59)));
        assert!(supervisor.should_self_heal(start + Duration::from_secs(60)));
    }

    struct FlakyConnector {
        fail_first: usize,
        connects: Arc<AtomicUsize>,
        resubscribes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        type Link = usize;

        async fn connect(&mut self) -> Result<usize, ConnectionError> {
            let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(ConnectionError::Connect(format!("attempt {attempt}")));
            }
            Ok(attempt)
        }

        async fn resubscribe(&mut self, _link: &mut usize) -> Result<(), ConnectionError> {
            self.resubscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn serve(&mut self, _link: usize) -> Result<(), ConnectionError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct CountingHeal(Arc<AtomicUsize>);

    #[async_trait]
    impl SelfHeal for CountingHeal {
        async fn heal(&self, _connector: &str) -> Result<(), ConnectionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn integration_reconnects_after_failures_then_resubscribes_once_connected() {
        let connects = Arc::new(AtomicUsize::new(0));
        let resubscribes = Arc::new(AtomicUsize::new(0));
        let heals = Arc::new(AtomicUsize::new(0));
        let mut connector = FlakyConnector {
            fail_first: 3,
            connects: Arc::clone(&connects),
            resubscribes: Arc::clone(&resubscribes),
        };
        let heal = CountingHeal(Arc::clone(&heals));
        let (trigger, signal) = shutdown_channel();

        let task = tokio::spawn(async move {
            let mut supervisor = supervisor(2);
            run_with_reconnect(&mut connector, &mut supervisor, Some(&heal), signal).await;
            supervisor
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 4);
        assert_eq!(resubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(heals.load(Ordering::SeqCst), 1);

        trigger.trigger();
        let supervisor = task.await.expect("join");
        assert_eq!(supervisor.connect_count(), 1);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }
}
