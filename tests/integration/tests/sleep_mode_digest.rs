use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use vigil_core::{GatewayMode, InboundItem, Notifier};
use vigil_store::{EventBus, ModeStore, SqliteStore, StreamConfig};
use vigil_triage::{EventTriage, TriageConfig, TriageSink};

#[derive(Default)]
struct Prompts(Mutex<Vec<InboundItem>>);

#[async_trait]
impl TriageSink for Prompts {
    async fn dispatch(&self, item: InboundItem) {
        self.0.lock().expect("prompts").push(item);
    }
}

struct Silent;

#[async_trait]
impl Notifier for Silent {
    async fn notify_priority(&self, _text: &str) {}
}

fn triage(store: &Arc<SqliteStore>, prompts: &Arc<Prompts>) -> EventTriage {
    EventTriage::new(
        TriageConfig::default(),
        store.clone(),
        store.clone(),
        prompts.clone(),
        Arc::new(Silent),
    )
}

fn event(id: &str, kind: &str, message: &str) -> String {
    json!({
        "id": id,
        "type": kind,
        "source": "ci",
        "payload": {"message": message},
        "ts": 1_700_000_000_000u64,
    })
    .to_string()
}

#[tokio::test]
async fn integration_sleep_mode_survives_restart_and_defers_until_wake() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("vigil.sqlite");
    let prompts = Arc::new(Prompts::default());

    {
        let store =
            Arc::new(SqliteStore::open(&db_path, StreamConfig::default()).expect("open store"));
        let first = triage(&store, &prompts);
        store
            .push(&event("s1", "gateway.sleep", "night"))
            .await
            .expect("push");
        store
            .push(&event("d1", "deploy.failed", "build 12 failed"))
            .await
            .expect("push");
        let report = first.run_cycle().await.expect("cycle");
        assert_eq!(report.mode_after, GatewayMode::Sleep);
        assert_eq!(report.immediate, 0);
        assert_eq!(report.batched, 1);
        assert!(first.flush_digest().await.expect("flush").is_none());
    }

    let store = Arc::new(SqliteStore::open(&db_path, StreamConfig::default()).expect("reopen"));
    assert_eq!(store.load_mode().await.expect("mode"), GatewayMode::Sleep);

    let second = triage(&store, &prompts);
    store
        .push(&event("w1", "gateway.wake", "morning"))
        .await
        .expect("push");
    store
        .push(&event("d2", "deploy.succeeded", "build 13 shipped"))
        .await
        .expect("push");
    let report = second.run_cycle().await.expect("cycle");
    assert_eq!(report.mode_after, GatewayMode::Active);
    assert_eq!(store.load_mode().await.expect("mode"), GatewayMode::Active);

    let summary = second
        .flush_digest()
        .await
        .expect("flush")
        .expect("digest after wake");
    assert_eq!(summary.total, 1);
    let prompts = prompts.0.lock().expect("prompts");
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].metadata["kind"], "event_digest");
}
