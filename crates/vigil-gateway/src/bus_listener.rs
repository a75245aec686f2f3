use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use vigil_resilience::{ConnectionError, Connector, ShutdownSignal};
use vigil_store::EventBus;
use vigil_triage::{EventTriage, TriageReport};

/// Wakes triage on every bus push, and on a poll interval for producers
/// that write to the store directly.
pub struct BusListener {
    bus: Arc<dyn EventBus>,
    triage: Arc<EventTriage>,
    poll_interval: Duration,
}

impl BusListener {
    pub fn new(bus: Arc<dyn EventBus>, triage: Arc<EventTriage>) -> Self {
        let poll_interval = triage.config().poll_interval;
        Self {
            bus,
            triage,
            poll_interval,
        }
    }

    async fn cycle(&self) -> Result<TriageReport, ConnectionError> {
        self.triage
            .run_cycle()
            .await
            .map_err(|error| ConnectionError::Disconnected(error.to_string()))
    }
}

#[async_trait]
impl Connector for BusListener {
    type Link = ();

    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.bus
            .ping()
            .await
            .map_err(|error| ConnectionError::Connect(error.to_string()))
    }

    /// Catches up on everything pushed while the listener was down.
    async fn resubscribe(&mut self, _link: &mut ()) -> Result<(), ConnectionError> {
        let report = self.cycle().await?;
        if report.received > 0 {
            info!(received = report.received, "bus listener caught up on backlog");
        }
        Ok(())
    }

    async fn serve(&mut self, _link: ()) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                _ = self.bus.wait_for_push() => debug!("bus push wake"),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            self.cycle().await?;
        }
    }
}

/// Flushes the batch digest every `interval` until shutdown.
pub async fn run_digest_timer(
    triage: Arc<EventTriage>,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(error) = triage.flush_digest().await {
                    warn!(error = %error, "digest flush failed");
                }
            }
            _ = shutdown.wait() => break,
        }
    }
}
