use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vigil_core::{GatewayMode, InboundItem, Notifier, DEFAULT_SOURCE};
use vigil_store::{EventBus, ModeStore, StoreResult};

use crate::seen::DEFAULT_SEEN_CAPACITY;
use crate::{
    classify, parse_system_event, BatchDigest, DigestSummary, RecentlySeen, SystemEvent, Tier,
};

const DEFAULT_WAKE_TYPE: &str = "operator.message";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_DIGEST_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriageConfig {
    pub seen_capacity: usize,
    /// The one event type allowed through while the gateway sleeps.
    pub wake_type: String,
    pub poll_interval: Duration,
    pub digest_interval: Duration,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            wake_type: DEFAULT_WAKE_TYPE.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            digest_interval: DEFAULT_DIGEST_INTERVAL,
        }
    }
}

/// Where triage hands prompts destined for the agent session.
#[async_trait]
pub trait TriageSink: Send + Sync {
    async fn dispatch(&self, item: InboundItem);
}

/// Counters for one triage wake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriageReport {
    pub received: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub immediate: usize,
    pub batched: usize,
    pub suppressed: usize,
    pub direct_messages: usize,
    pub mode_before: GatewayMode,
    pub mode_after: GatewayMode,
}

impl TriageReport {
    fn new(received: usize, mode: GatewayMode) -> Self {
        Self {
            received,
            malformed: 0,
            duplicates: 0,
            immediate: 0,
            batched: 0,
            suppressed: 0,
            direct_messages: 0,
            mode_before: mode,
            mode_after: mode,
        }
    }
}

#[derive(Debug)]
struct TriageState {
    seen: RecentlySeen,
    digest: BatchDigest,
}

pub struct EventTriage {
    config: TriageConfig,
    bus: Arc<dyn EventBus>,
    modes: Arc<dyn ModeStore>,
    sink: Arc<dyn TriageSink>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<TriageState>,
}

impl EventTriage {
    pub fn new(
        config: TriageConfig,
        bus: Arc<dyn EventBus>,
        modes: Arc<dyn ModeStore>,
        sink: Arc<dyn TriageSink>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let state = TriageState {
            seen: RecentlySeen::with_capacity(config.seen_capacity),
            digest: BatchDigest::default(),
        };
        Self {
            config,
            bus,
            modes,
            sink,
            notifier,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    pub async fn buffered_len(&self) -> u64 {
        self.state.lock().await.digest.len()
    }

    /// Runs one wake: drain, parse, dedup, classify, apply mode rules, dispatch.
    pub async fn run_cycle(&self) -> StoreResult<TriageReport> {
        let mut state = self.state.lock().await;
        let mode_before = self.modes.load_mode().await?;
        let raw_events = self.bus.drain_pending().await?;
        let mut report = TriageReport::new(raw_events.len(), mode_before);
        if raw_events.is_empty() {
            return Ok(report);
        }

        let mut immediate = Vec::new();
        let mut batched = Vec::new();
        let mut mode = mode_before;
        for raw in &raw_events {
            let Some(event) = parse_system_event(raw) else {
                report.malformed += 1;
                debug!(payload_bytes = raw.len(), "dropped malformed system event");
                continue;
            };
            if !state.seen.insert(&event.id) {
                report.duplicates += 1;
                continue;
            }
            let kind = event.kind();
            if let Some(next_mode) = kind.mode_control() {
                info!(event_id = %event.id, mode = %next_mode, "mode-control event");
                mode = next_mode;
                continue;
            }
            match classify(&kind) {
                Tier::Immediate => immediate.push(event),
                Tier::Batched => batched.push(event),
                Tier::Suppressed => {
                    report.suppressed += 1;
                    debug!(event_id = %event.id, event_type = %kind, "suppressed system event");
                }
            }
        }

        if mode.is_sleep() {
            let (wake, deferred): (Vec<_>, Vec<_>) = immediate
                .into_iter()
                .partition(|event| event.event_type == self.config.wake_type);
            batched.extend(deferred);
            if !wake.is_empty() {
                mode = GatewayMode::Active;
            }
            immediate = wake;
        }

        if mode != mode_before {
            // Drained events are already acked on the bus; keep routing them.
            if let Err(error) = self.modes.store_mode(mode).await {
                warn!(%error, to = %mode, "failed to persist gateway mode");
            }
            info!(from = %mode_before, to = %mode, "gateway mode changed");
        }
        report.mode_after = mode;

        report.batched = batched.len();
        for event in &batched {
            state.digest.push(event);
        }
        drop(state);

        report.immediate = immediate.len();
        report.direct_messages = self.dispatch_immediate(immediate).await;
        info!(
            received = report.received,
            malformed = report.malformed,
            duplicates = report.duplicates,
            immediate = report.immediate,
            batched = report.batched,
            suppressed = report.suppressed,
            direct_messages = report.direct_messages,
            mode = %report.mode_after,
            "triage cycle complete"
        );
        Ok(report)
    }

    /// Direct messages go to the priority side-channel; the rest become one prompt.
    async fn dispatch_immediate(&self, events: Vec<SystemEvent>) -> usize {
        let (direct, prompted): (Vec<_>, Vec<_>) = events
            .into_iter()
            .partition(|event| event.direct_message().is_some());
        for event in &direct {
            if let Some(message) = event.direct_message() {
                self.notifier.notify_priority(message).await;
            }
        }
        if let Some(item) = build_immediate_prompt(&prompted) {
            self.sink.dispatch(item).await;
        }
        direct.len()
    }

    /// Sends the batched digest while active; during sleep the buffer is kept.
    pub async fn flush_digest(&self) -> StoreResult<Option<DigestSummary>> {
        let mode = self.modes.load_mode().await?;
        if mode.is_sleep() {
            debug!("digest flush skipped while sleeping");
            return Ok(None);
        }
        let summary = self.state.lock().await.digest.take_summary();
        if let Some(summary) = &summary {
            info!(total = summary.total, "flushing event digest");
            let item = InboundItem::new(DEFAULT_SOURCE, summary.render()).with_metadata(json!({
                "kind": "event_digest",
                "total": summary.total,
            }));
            self.sink.dispatch(item).await;
        }
        Ok(summary)
    }
}

fn build_immediate_prompt(events: &[SystemEvent]) -> Option<InboundItem> {
    if events.is_empty() {
        return None;
    }
    let source = events
        .iter()
        .find_map(SystemEvent::origin)
        .unwrap_or(DEFAULT_SOURCE)
        .to_string();
    let mut lines = vec![format!(
        "[system events] {} event{} need attention:",
        events.len(),
        if events.len() == 1 { "" } else { "s" }
    )];
    for event in events {
        let detail = event.message_text().unwrap_or("(no details)");
        if event.source.is_empty() {
            lines.push(format!("- {}: {detail}", event.event_type));
        } else {
            lines.push(format!("- {} ({}): {detail}", event.event_type, event.source));
        }
    }
    let event_ids: Vec<&str> = events.iter().map(|event| event.id.as_str()).collect();
    Some(
        InboundItem::new(source, lines.join("\n")).with_metadata(json!({
            "kind": "system_events",
            "event_ids": event_ids,
        })),
    )
}
