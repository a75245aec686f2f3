use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use vigil_core::{current_unix_timestamp_ms, AgentSession, ModelRef, Notifier};

use crate::{lock_or_recover, ClockFn};

/// Receives JSON events describing fallback transitions.
pub type FallbackEventSink = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

const DEFAULT_FALLBACK_AFTER_FAILURES: u32 = 3;
const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(600);

/// Turn lifecycle hooks fed by the drain loop and the session event dispatcher.
#[async_trait]
pub trait TurnObserver: Send + Sync {
    async fn on_prompt_dispatched(&self) {}
    async fn on_activity(&self) {}
    async fn on_prompt_complete(&self) {}
    async fn on_prompt_error(&self, _consecutive_failures: u32) {}
    async fn pause_timeout_watch(&self) {}
    async fn resume_timeout_watch(&self) {}
}

/// Decides whether the primary model is usable again.
#[async_trait]
pub trait PrimaryProbe: Send + Sync {
    async fn primary_healthy(&self, primary: &ModelRef, state: &FallbackState) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackConfig {
    pub primary: ModelRef,
    pub fallback: ModelRef,
    pub fallback_after_failures: u32,
    pub prompt_timeout: Duration,
    pub probe_interval: Duration,
}

impl FallbackConfig {
    pub fn new(primary: ModelRef, fallback: ModelRef) -> Self {
        Self {
            primary,
            fallback,
            fallback_after_failures: DEFAULT_FALLBACK_AFTER_FAILURES,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// `active == false` means the session runs the primary model.
pub struct FallbackState {
    pub active: bool,
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub active_since_unix_ms: Option<u64>,
    #[serde(default)]
    pub activation_count: u64,
}

#[derive(Default)]
struct ControllerState {
    fallback: FallbackState,
    armed: bool,
    watch_paused: bool,
    switching: bool,
    timeout_task: Option<JoinHandle<()>>,
    probe_task: Option<JoinHandle<()>>,
}

impl ControllerState {
    fn cancel_timeout(&mut self) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
    }
}

struct FallbackInner {
    config: FallbackConfig,
    session: Arc<dyn AgentSession>,
    notifier: Arc<dyn Notifier>,
    probe: Arc<dyn PrimaryProbe>,
    event_sink: Option<FallbackEventSink>,
    clock: ClockFn,
    state: Mutex<ControllerState>,
}

/// Primary/fallback model state machine.
#[derive(Clone)]
pub struct FallbackController {
    inner: Arc<FallbackInner>,
}

impl FallbackController {
    pub fn new(
        config: FallbackConfig,
        session: Arc<dyn AgentSession>,
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn PrimaryProbe>,
        event_sink: Option<FallbackEventSink>,
    ) -> Self {
        Self::new_with_clock(
            config,
            session,
            notifier,
            probe,
            event_sink,
            Arc::new(current_unix_timestamp_ms),
        )
    }

    fn new_with_clock(
        config: FallbackConfig,
        session: Arc<dyn AgentSession>,
        notifier: Arc<dyn Notifier>,
        probe: Arc<dyn PrimaryProbe>,
        event_sink: Option<FallbackEventSink>,
        clock: ClockFn,
    ) -> Self {
        Self {
            inner: Arc::new(FallbackInner {
                config,
                session,
                notifier,
                probe,
                event_sink,
                clock,
                state: Mutex::new(ControllerState::default()),
            }),
        }
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.inner.config
    }

    pub fn state(&self) -> FallbackState {
        lock_or_recover(&self.inner.state).fallback.clone()
    }

    fn emit(&self, event: serde_json::Value) {
        if let Some(sink) = &self.inner.event_sink {
            sink(event);
        }
    }

    fn schedule_timeout(&self) {
        let controller = self.clone();
        let timeout = self.inner.config.prompt_timeout;
        let mut state = lock_or_recover(&self.inner.state);
        state.cancel_timeout();
        state.timeout_task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            controller.on_timeout_elapsed().await;
        }));
    }

    async fn on_timeout_elapsed(&self) {
        {
            let mut state = lock_or_recover(&self.inner.state);
            state.timeout_task = None;
            if !state.armed || state.watch_paused {
                return;
            }
            state.armed = false;
        }
        let timeout_ms =
            u64::try_from(self.inner.config.prompt_timeout.as_millis()).unwrap_or(u64::MAX);
        warn!(timeout_ms, "prompt showed no activity within timeout");
        self.activate("prompt_timeout").await;
    }

    /// Swaps the session to the fallback model. No-op while already active.
    pub async fn activate(&self, reason: &str) {
        {
            let mut state = lock_or_recover(&self.inner.state);
            if state.fallback.active || state.switching {
                return;
            }
            state.switching = true;
        }

        let config = &self.inner.config;
        let result = self.inner.session.set_model(&config.fallback).await;
        let activation_count = {
            let mut state = lock_or_recover(&self.inner.state);
            state.switching = false;
            if let Err(error) = &result {
                drop(state);
                warn!(
                    error = %error,
                    model = %config.fallback,
                    "failed to switch to fallback model"
                );
                self.emit(serde_json::json!({
                    "type": "model_fallback_failed",
                    "to_model": config.fallback.to_string(),
                    "reason": reason,
                    "error": error.to_string(),
                }));
                return;
            }
            state.cancel_timeout();
            state.armed = false;
            state.fallback = FallbackState {
                active: true,
                fallback_provider: Some(config.fallback.provider.clone()),
                fallback_model: Some(config.fallback.model.clone()),
                active_since_unix_ms: Some((self.inner.clock)()),
                activation_count: state.fallback.activation_count.saturating_add(1),
            };
            state.fallback.activation_count
        };
        self.schedule_probe();

        info!(
            from = %config.primary,
            to = %config.fallback,
            reason,
            activation_count,
            "switched to fallback model"
        );
        self.emit(serde_json::json!({
            "type": "model_fallback_activated",
            "from_model": config.primary.to_string(),
            "to_model": config.fallback.to_string(),
            "reason": reason,
            "activation_count": activation_count,
        }));
        self.inner
            .notifier
            .notify_priority(&format!(
                "Primary model {} is struggling ({reason}); switched to fallback {}.",
                config.primary, config.fallback
            ))
            .await;
    }

    fn schedule_probe(&self) {
        let controller = self.clone();
        let interval = self.inner.config.probe_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let state = controller.state();
                if !state.active {
                    return;
                }
                if controller
                    .inner
                    .probe
                    .primary_healthy(&controller.inner.config.primary, &state)
                    .await
                    && controller.restore_primary().await
                {
                    return;
                }
            }
        });
        let mut state = lock_or_recover(&self.inner.state);
        if let Some(previous) = state.probe_task.replace(task) {
            previous.abort();
        }
    }

    /// Swaps back to the primary model; returns true on success.
    async fn restore_primary(&self) -> bool {
        let config = &self.inner.config;
        if let Err(error) = self.inner.session.set_model(&config.primary).await {
            warn!(error = %error, model = %config.primary, "failed to restore primary model");
            return false;
        }
        let active_for_ms = {
            let mut state = lock_or_recover(&self.inner.state);
            // Dropping the handle detaches; this runs inside the probe task itself.
            state.probe_task.take();
            let since = state.fallback.active_since_unix_ms.unwrap_or_default();
            state.fallback.active = false;
            state.fallback.fallback_provider = None;
            state.fallback.fallback_model = None;
            state.fallback.active_since_unix_ms = None;
            (self.inner.clock)().saturating_sub(since)
        };
        info!(model = %config.primary, active_for_ms, "restored primary model");
        self.emit(serde_json::json!({
            "type": "model_fallback_recovered",
            "model": config.primary.to_string(),
            "active_for_ms": active_for_ms,
        }));
        self.inner
            .notifier
            .notify_priority(&format!(
                "Primary model {} is healthy again; fallback released.",
                config.primary
            ))
            .await;
        true
    }
}

#[async_trait]
impl TurnObserver for FallbackController {
    async fn on_prompt_dispatched(&self) {
        let paused = {
            let mut state = lock_or_recover(&self.inner.state);
            state.armed = true;
            state.watch_paused
        };
        if !paused {
            self.schedule_timeout();
        }
    }

    async fn on_activity(&self) {
        let reschedule = {
            let state = lock_or_recover(&self.inner.state);
            state.armed && !state.watch_paused
        };
        if reschedule {
            self.schedule_timeout();
        }
    }

    async fn on_prompt_complete(&self) {
        let mut state = lock_or_recover(&self.inner.state);
        state.armed = false;
        state.cancel_timeout();
    }

    async fn on_prompt_error(&self, consecutive_failures: u32) {
        {
            let mut state = lock_or_recover(&self.inner.state);
            state.armed = false;
            state.cancel_timeout();
        }
        if consecutive_failures >= self.inner.config.fallback_after_failures {
            self.activate("consecutive_failures").await;
        }
    }

    async fn pause_timeout_watch(&self) {
        let mut state = lock_or_recover(&self.inner.state);
        state.watch_paused = true;
        state.cancel_timeout();
    }

    async fn resume_timeout_watch(&self) {
        let rearm = {
            let mut state = lock_or_recover(&self.inner.state);
            state.watch_paused = false;
            state.armed
        };
        if rearm {
            self.schedule_timeout();
        }
    }
}
