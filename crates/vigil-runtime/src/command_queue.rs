use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vigil_core::{current_unix_timestamp_ms, AgentSession, InboundItem};
use vigil_store::DurableLog;

use crate::{
    lock_or_recover, ClockFn, FailureCounter, IdleGate, TurnClock, TurnObserver, TurnOutcome,
    WaitOutcome,
};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(30);
const DEFAULT_ABORT_GRACE: Duration = Duration::from_secs(10);

/// Completion of the running drain loop; every caller of `drain` shares it.
pub type DrainHandle = Shared<BoxFuture<'static, ()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandQueueConfig {
    /// Upper bound on waiting for the session's idle signal.
    pub idle_timeout: Duration,
    pub dedup_window: Duration,
    /// How long a timed-out turn gets to emit its terminal event after abort.
    pub abort_grace: Duration,
}

impl Default for CommandQueueConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            dedup_window: DEFAULT_DEDUP_WINDOW,
            abort_grace: DEFAULT_ABORT_GRACE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Duplicate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub depth: usize,
    pub draining: bool,
    #[serde(default)]
    pub active_source: Option<String>,
    pub last_dispatch_unix_ms: u64,
    pub last_completion_unix_ms: u64,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<InboundItem>,
    recent_hashes: HashMap<String, u64>,
    active_source: Option<String>,
    drain: Option<DrainHandle>,
    started: bool,
    stopped: bool,
}

struct QueueInner {
    config: CommandQueueConfig,
    log: Arc<dyn DurableLog>,
    session: Arc<dyn AgentSession>,
    observer: Arc<dyn TurnObserver>,
    gate: Arc<IdleGate>,
    failures: FailureCounter,
    turn_clock: TurnClock,
    clock: ClockFn,
    state: Mutex<QueueState>,
}

/// Single-flight dispatcher: at most one prompt is ever in flight.
#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl CommandQueue {
    pub fn new(
        config: CommandQueueConfig,
        log: Arc<dyn DurableLog>,
        session: Arc<dyn AgentSession>,
        observer: Arc<dyn TurnObserver>,
        gate: Arc<IdleGate>,
    ) -> Self {
        Self::new_with_clock(
            config,
            log,
            session,
            observer,
            gate,
            Arc::new(current_unix_timestamp_ms),
        )
    }

    pub(crate) fn new_with_clock(
        config: CommandQueueConfig,
        log: Arc<dyn DurableLog>,
        session: Arc<dyn AgentSession>,
        observer: Arc<dyn TurnObserver>,
        gate: Arc<IdleGate>,
        clock: ClockFn,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                log,
                session,
                observer,
                gate,
                failures: FailureCounter::new(),
                turn_clock: TurnClock::new(),
                clock,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn failures(&self) -> FailureCounter {
        self.inner.failures.clone()
    }

    pub fn turn_clock(&self) -> TurnClock {
        self.inner.turn_clock.clone()
    }

    pub fn gate(&self) -> Arc<IdleGate> {
        Arc::clone(&self.inner.gate)
    }

    /// Source of the item currently in flight, used to route the response.
    pub fn active_source(&self) -> Option<String> {
        lock_or_recover(&self.inner.state).active_source.clone()
    }

    pub fn depth(&self) -> usize {
        lock_or_recover(&self.inner.state).items.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = lock_or_recover(&self.inner.state);
        QueueSnapshot {
            depth: state.items.len(),
            draining: state.drain.is_some(),
            active_source: state.active_source.clone(),
            last_dispatch_unix_ms: self.inner.turn_clock.last_dispatch_unix_ms(),
            last_completion_unix_ms: self.inner.turn_clock.last_completion_unix_ms(),
            consecutive_failures: self.inner.failures.current(),
        }
    }

    /// Appends `item` unless the same source sent the same content within the
    /// dedup window.
    pub fn enqueue(&self, item: InboundItem) -> EnqueueOutcome {
        let now = (self.inner.clock)();
        let window_ms =
            u64::try_from(self.inner.config.dedup_window.as_millis()).unwrap_or(u64::MAX);
        let hash = dedup_hash(&item.source, &item.prompt);
        let mut state = lock_or_recover(&self.inner.state);
        state
            .recent_hashes
            .retain(|_, seen_at| now.saturating_sub(*seen_at) < window_ms);
        if state.recent_hashes.contains_key(&hash) {
            debug!(source = %item.source, "dropped duplicate inbound item");
            return EnqueueOutcome::Duplicate;
        }
        state.recent_hashes.insert(hash, now);
        state.items.push_back(item);
        EnqueueOutcome::Queued
    }

    /// Enqueues and, once the queue has started, makes sure the loop is running.
    pub fn submit(&self, item: InboundItem) -> EnqueueOutcome {
        let outcome = self.enqueue(item);
        if outcome == EnqueueOutcome::Queued && lock_or_recover(&self.inner.state).started {
            self.drain();
        }
        outcome
    }

    /// Direct prompt without a log entry.
    pub fn send_direct(&self, source: &str, prompt: &str) -> EnqueueOutcome {
        self.submit(InboundItem::new(source, prompt))
    }

    /// Pushes every unacknowledged log entry ahead of the live queue.
    /// Entries already queued (same log id) are skipped.
    pub async fn replay_unacked(&self) -> anyhow::Result<usize> {
        let unacked = self.inner.log.get_unacked().await?;
        let mut state = lock_or_recover(&self.inner.state);
        let queued: HashSet<String> = state
            .items
            .iter()
            .filter_map(|item| item.stream_id.clone())
            .collect();
        let replayed: Vec<InboundItem> = unacked
            .into_iter()
            .filter(|item| {
                item.stream_id
                    .as_ref()
                    .map_or(true, |id| !queued.contains(id))
            })
            .collect();
        let count = replayed.len();
        for item in replayed.into_iter().rev() {
            state.items.push_front(item);
        }
        drop(state);
        if count > 0 {
            info!(count, "replayed unacknowledged log entries");
        }
        Ok(count)
    }

    /// Marks the queue started and begins draining.
    pub fn start(&self) -> DrainHandle {
        lock_or_recover(&self.inner.state).started = true;
        self.drain()
    }

    /// Stops dispatching once the in-flight turn ends. Queued items are not
    /// dropped from the log; they replay on the next start.
    pub fn stop(&self) -> Option<DrainHandle> {
        let mut state = lock_or_recover(&self.inner.state);
        state.stopped = true;
        state.drain.clone()
    }

    /// Starts the drain loop, or returns the one already running.
    pub fn drain(&self) -> DrainHandle {
        let mut state = lock_or_recover(&self.inner.state);
        if let Some(running) = &state.drain {
            return running.clone();
        }
        if state.stopped {
            return async {}.boxed().shared();
        }
        let queue = self.clone();
        let handle = async move { queue.drain_loop().await }.boxed().shared();
        state.drain = Some(handle.clone());
        drop(state);
        tokio::spawn(handle.clone());
        handle
    }

    async fn drain_loop(&self) {
        loop {
            let item = {
                let mut state = lock_or_recover(&self.inner.state);
                let next = if state.stopped {
                    None
                } else {
                    state.items.pop_front()
                };
                match next {
                    Some(item) => {
                        state.active_source = Some(item.source.clone());
                        item
                    }
                    None => {
                        state.active_source = None;
                        state.drain = None;
                        return;
                    }
                }
            };
            self.dispatch(item).await;
            lock_or_recover(&self.inner.state).active_source = None;
        }
    }

    async fn dispatch(&self, item: InboundItem) {
        let inner = &self.inner;
        let wait = inner.gate.arm();
        let turn_id = wait.turn_id();
        inner.turn_clock.mark_dispatch((inner.clock)());
        inner.observer.on_prompt_dispatched().await;

        if let Err(error) = inner.session.prompt(&item.prompt).await {
            inner.gate.disarm(turn_id);
            inner.turn_clock.mark_completion((inner.clock)());
            let failures = inner.failures.record_failure();
            warn!(
                source = %item.source,
                stream_id = item.stream_id.as_deref().unwrap_or("-"),
                failures,
                error = %error,
                "prompt dispatch failed; entry left for replay"
            );
            inner.observer.on_prompt_error(failures).await;
            return;
        }

        match wait.wait(inner.config.idle_timeout).await {
            WaitOutcome::Turn(TurnOutcome::Completed) => {
                inner.failures.record_success();
                inner.observer.on_prompt_complete().await;
            }
            WaitOutcome::Turn(TurnOutcome::Failed(message)) => {
                let failures = inner.failures.record_failure();
                warn!(source = %item.source, failures, error = %message, "turn ended with error");
                inner.observer.on_prompt_error(failures).await;
            }
            WaitOutcome::TimedOut => {
                inner.gate.disarm(turn_id);
                let failures = inner.failures.record_failure();
                let idle_timeout_ms =
                    u64::try_from(inner.config.idle_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    source = %item.source,
                    failures,
                    idle_timeout_ms,
                    "turn did not signal idle before safety timeout"
                );
                inner.observer.on_prompt_error(failures).await;
                self.settle_abandoned_turn().await;
            }
            WaitOutcome::Abandoned => {
                inner.gate.disarm(turn_id);
                let failures = inner.failures.record_failure();
                warn!(source = %item.source, failures, "turn waiter was dropped before idle");
                inner.observer.on_prompt_error(failures).await;
            }
        }

        if let Some(stream_id) = &item.stream_id {
            match inner.log.ack(stream_id).await {
                Ok(true) => debug!(stream_id = %stream_id, "acknowledged log entry"),
                Ok(false) => debug!(stream_id = %stream_id, "log entry was not pending"),
                Err(error) => {
                    warn!(stream_id = %stream_id, error = %error, "failed to ack log entry")
                }
            }
        }
    }

    /// Aborts the timed-out turn and swallows its late terminal event so it
    /// cannot resolve the gate armed for the next prompt.
    async fn settle_abandoned_turn(&self) {
        let inner = &self.inner;
        let settle = inner.gate.arm();
        let settle_id = settle.turn_id();
        if let Err(error) = inner.session.abort().await {
            warn!(error = %error, "abort of timed-out turn failed");
        }
        match settle.wait(inner.config.abort_grace).await {
            WaitOutcome::Turn(outcome) => {
                debug!(?outcome, "discarded terminal event of abandoned turn");
            }
            WaitOutcome::TimedOut | WaitOutcome::Abandoned => {
                inner.gate.disarm(settle_id);
                debug!("abandoned turn emitted no terminal event");
            }
        }
    }
}

/// Hash of `(source, content with channel preamble stripped)`.
fn dedup_hash(source: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(strip_channel_preamble(content).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Removes a leading `---` frontmatter block and leading `[channel: ...]` lines.
pub fn strip_channel_preamble(content: &str) -> &str {
    let mut rest = content.trim_start();
    if let Some(after_open) = rest.strip_prefix("---") {
        if after_open.starts_with('\n') || after_open.starts_with("\r\n") {
            if let Some(close) = after_open.find("\n---") {
                rest = after_open[close + 4..].trim_start();
            }
        }
    }
    loop {
        let (line, remainder) = rest.split_once('\n').unwrap_or((rest, ""));
        let line = line.trim();
        if line.starts_with("[channel:") && line.ends_with(']') {
            rest = remainder.trim_start();
        } else {
            break;
        }
    }
    rest.trim()
}
