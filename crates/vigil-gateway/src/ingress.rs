//! HTTP inbound connector. Handlers persist and enqueue (or push to the bus)
//! and return; they never wait on the agent.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{info, warn};
use vigil_core::{InboundItem, DEFAULT_SOURCE};
use vigil_resilience::ShutdownSignal;
use vigil_runtime::{CommandQueue, EnqueueOutcome};
use vigil_store::{DurableLog, EventBus, ModeStore};
use vigil_triage::{EventTriage, TriageSink};

const INGRESS_SCHEMA_VERSION: u32 = 1;
const INBOUND_ENDPOINT: &str = "/v1/inbound";
const EVENTS_ENDPOINT: &str = "/v1/events";
const DIGEST_FLUSH_ENDPOINT: &str = "/v1/digest/flush";
const HEALTH_ENDPOINT: &str = "/v1/health";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedInbound {
    /// `None` when the log was unavailable and the item runs without durability.
    pub stream_id: Option<String>,
    pub duplicate: bool,
}

/// Persists `item`, then hands it to the queue. A duplicate is acked at once
/// so it is never replayed.
pub async fn accept_inbound(
    log: &dyn DurableLog,
    queue: &CommandQueue,
    mut item: InboundItem,
) -> AcceptedInbound {
    let stream_id = match log.persist(&item).await {
        Ok(id) => Some(id),
        Err(error) => {
            warn!(
                source = %item.source,
                error = %error,
                "failed to persist inbound item; delivering without durability"
            );
            None
        }
    };
    if let Some(id) = &stream_id {
        item = item.with_stream_id(id.clone());
    }
    let duplicate = queue.submit(item) == EnqueueOutcome::Duplicate;
    if duplicate {
        if let Some(id) = &stream_id {
            if let Err(error) = log.ack(id).await {
                warn!(stream_id = %id, error = %error, "failed to ack duplicate inbound item");
            }
        }
    }
    AcceptedInbound {
        stream_id,
        duplicate,
    }
}

/// Triage output takes the same persist-then-enqueue path as chat traffic.
pub struct QueueSink {
    log: Arc<dyn DurableLog>,
    queue: CommandQueue,
}

impl QueueSink {
    pub fn new(log: Arc<dyn DurableLog>, queue: CommandQueue) -> Self {
        Self { log, queue }
    }
}

#[async_trait]
impl TriageSink for QueueSink {
    async fn dispatch(&self, item: InboundItem) {
        accept_inbound(self.log.as_ref(), &self.queue, item).await;
    }
}

pub struct IngressState {
    pub log: Arc<dyn DurableLog>,
    pub bus: Arc<dyn EventBus>,
    pub modes: Arc<dyn ModeStore>,
    pub queue: CommandQueue,
    pub triage: Arc<EventTriage>,
}

#[derive(Debug, Deserialize)]
struct InboundRequest {
    #[serde(default)]
    source: Option<String>,
    prompt: String,
    #[serde(default)]
    metadata: Value,
}

pub fn build_ingress_router(state: Arc<IngressState>) -> Router {
    Router::new()
        .route(INBOUND_ENDPOINT, post(handle_inbound))
        .route(EVENTS_ENDPOINT, post(handle_event))
        .route(DIGEST_FLUSH_ENDPOINT, post(handle_digest_flush))
        .route(HEALTH_ENDPOINT, get(handle_health))
        .with_state(state)
}

pub async fn bind_ingress(bind: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind ingress on {bind}"))
}

/// Serves until `shutdown` fires; new requests are refused from then on.
pub async fn serve_ingress(
    listener: TcpListener,
    state: Arc<IngressState>,
    mut shutdown: ShutdownSignal,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("failed to resolve ingress listen address")?;
    info!(addr = %local_addr, "ingress listening");
    axum::serve(listener, build_ingress_router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
        .context("ingress server exited unexpectedly")
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message.into(),
            }
        })),
    )
        .into_response()
}

async fn handle_inbound(
    State(state): State<Arc<IngressState>>,
    Json(request): Json<InboundRequest>,
) -> Response {
    let prompt = request.prompt.trim();
    if prompt.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "empty_prompt",
            "prompt must not be empty",
        );
    }
    let source = request
        .source
        .as_deref()
        .map(str::trim)
        .filter(|source| !source.is_empty())
        .unwrap_or(DEFAULT_SOURCE);
    let item = InboundItem::new(source, prompt).with_metadata(request.metadata);
    let accepted = accept_inbound(state.log.as_ref(), &state.queue, item).await;
    (
        StatusCode::ACCEPTED,
        Json(json!({
            "schema_version": INGRESS_SCHEMA_VERSION,
            "status": if accepted.duplicate { "duplicate" } else { "queued" },
            "stream_id": accepted.stream_id,
            "durable": accepted.stream_id.is_some(),
            "depth": state.queue.depth(),
        })),
    )
        .into_response()
}

async fn handle_event(State(state): State<Arc<IngressState>>, body: Bytes) -> Response {
    let Ok(raw) = std::str::from_utf8(&body) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_utf8",
            "event payload must be utf-8",
        );
    };
    if raw.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty_event", "event payload is empty");
    }
    match state.bus.push(raw.trim()).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "schema_version": INGRESS_SCHEMA_VERSION,
                "status": "pushed",
            })),
        )
            .into_response(),
        Err(error) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "event_bus_unavailable",
            error.to_string(),
        ),
    }
}

async fn handle_digest_flush(State(state): State<Arc<IngressState>>) -> Response {
    match state.triage.flush_digest().await {
        Ok(summary) => (
            StatusCode::OK,
            Json(json!({
                "schema_version": INGRESS_SCHEMA_VERSION,
                "flushed": summary.is_some(),
                "digest": summary,
            })),
        )
            .into_response(),
        Err(error) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "digest_flush_failed",
            error.to_string(),
        ),
    }
}

async fn handle_health(State(state): State<Arc<IngressState>>) -> Response {
    let log_healthy = state.log.ping().await.is_ok();
    let bus_pending = state.bus.pending_len().await.ok();
    let mode = state.modes.load_mode().await.ok();
    let status = if log_healthy && bus_pending.is_some() {
        "ok"
    } else {
        "degraded"
    };
    (
        StatusCode::OK,
        Json(json!({
            "schema_version": INGRESS_SCHEMA_VERSION,
            "status": status,
            "log_healthy": log_healthy,
            "bus_pending": bus_pending,
            "mode": mode,
            "queue": state.queue.snapshot(),
            "digest_buffered": state.triage.buffered_len().await,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::{accept_inbound, build_ingress_router, IngressState, QueueSink};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;
    use vigil_core::{AgentSession, InboundItem, ModelRef, Notifier, SessionError};
    use vigil_runtime::{CommandQueue, CommandQueueConfig, IdleGate, TurnObserver};
    use vigil_store::{
        DurableLog, EventBus, InMemoryDurableLog, InMemoryEventBus, InMemoryModeStore,
    };
    use vigil_triage::{EventTriage, TriageConfig};

    struct IdleSession;

    #[async_trait::async_trait]
    impl AgentSession for IdleSession {
        async fn prompt(&self, _text: &str) -> Result<(), SessionError> {
            Ok(())
        }

        async fn abort(&self) -> Result<(), SessionError> {
            Ok(())
        }

        async fn set_model(&self, _model: &ModelRef) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct Silent;

    #[async_trait::async_trait]
    impl Notifier for Silent {
        async fn notify_priority(&self, _text: &str) {}
    }

    struct NoHooks;

    impl TurnObserver for NoHooks {}

    struct Harness {
        log: Arc<InMemoryDurableLog>,
        bus: Arc<InMemoryEventBus>,
        queue: CommandQueue,
        state: Arc<IngressState>,
    }

    fn harness() -> Harness {
        let log = Arc::new(InMemoryDurableLog::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let modes = Arc::new(InMemoryModeStore::new());
        let queue = CommandQueue::new(
            CommandQueueConfig::default(),
            log.clone(),
            Arc::new(IdleSession),
            Arc::new(NoHooks),
            Arc::new(IdleGate::new()),
        );
        let triage = Arc::new(EventTriage::new(
            TriageConfig::default(),
            bus.clone(),
            modes.clone(),
            Arc::new(QueueSink::new(log.clone(), queue.clone())),
            Arc::new(Silent),
        ));
        let state = Arc::new(IngressState {
            log: log.clone(),
            bus: bus.clone(),
            modes,
            queue: queue.clone(),
            triage,
        });
        Harness {
            log,
            bus,
            queue,
            state,
        }
    }

    async fn post_json(state: Arc<IngressState>, path: &str, body: Value) -> (StatusCode, Value) {
        let response = build_ingress_router(state)
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn integration_inbound_is_persisted_then_queued_without_draining() {
        let h = harness();
        let (status, body) = post_json(
            h.state.clone(),
            "/v1/inbound",
            json!({"source": "telegram:7", "prompt": "hello", "metadata": {"message_id": 1}}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["durable"], true);
        assert_eq!(h.queue.depth(), 1);

        let pending = h.log.peek_unacked().await.expect("peek");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source, "telegram:7");
        assert_eq!(pending[0].metadata["message_id"], 1);
    }

    #[tokio::test]
    async fn regression_duplicate_inbound_is_acked_and_not_replayed() {
        let h = harness();
        let first = accept_inbound(
            h.log.as_ref(),
            &h.queue,
            InboundItem::new("telegram:7", "same text"),
        )
        .await;
        let second = accept_inbound(
            h.log.as_ref(),
            &h.queue,
            InboundItem::new("telegram:7", "same text"),
        )
        .await;
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(h.queue.depth(), 1);
        let pending = h.log.peek_unacked().await.expect("peek");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stream_id, first.stream_id);
    }

    #[tokio::test]
    async fn functional_event_endpoint_only_pushes_to_bus() {
        let h = harness();
        let (status, body) = post_json(
            h.state.clone(),
            "/v1/events",
            json!({"id": "e1", "type": "build.failed", "source": "ci"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pushed");
        assert_eq!(h.bus.pending_len().await.expect("pending"), 1);
        assert_eq!(h.queue.depth(), 0);
    }

    #[tokio::test]
    async fn regression_empty_prompt_is_rejected() {
        let h = harness();
        let (status, body) =
            post_json(h.state.clone(), "/v1/inbound", json!({"prompt": "   "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "empty_prompt");
        assert_eq!(h.queue.depth(), 0);
    }
}
