use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use vigil_core::{
    AgentSession, ChannelSender, InboundItem, ModelRef, Notifier, SendOptions, SessionError,
    SessionEvent,
};
use vigil_runtime::{
    CommandQueue, CommandQueueConfig, IdleGate, SessionEventDispatcher, TurnObserver,
};
use vigil_store::{DurableLog, SqliteStore, StreamConfig};

/// Session that answers every prompt unless the prompt is listed in `hang_on`.
struct ScriptedSession {
    prompts: Mutex<Vec<String>>,
    hang_on: Vec<String>,
    events: mpsc::Sender<SessionEvent>,
}

impl ScriptedSession {
    fn new(events: mpsc::Sender<SessionEvent>, hang_on: &[&str]) -> Self {
        Self {
            prompts: Mutex::new(Vec::new()),
            hang_on: hang_on.iter().map(|prompt| prompt.to_string()).collect(),
            events,
        }
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts").clone()
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn prompt(&self, text: &str) -> Result<(), SessionError> {
        self.prompts.lock().expect("prompts").push(text.to_string());
        if self.hang_on.iter().any(|prompt| prompt == text) {
            return Ok(());
        }
        let reply = format!("done: {text}");
        for event in [
            SessionEvent::MessageStart,
            SessionEvent::TextDelta { delta: reply },
            SessionEvent::TurnEnd,
        ] {
            self.events
                .send(event)
                .await
                .map_err(|error| SessionError::Transport(error.to_string()))?;
        }
        Ok(())
    }

    async fn abort(&self) -> Result<(), SessionError> {
        Ok(())
    }

    async fn set_model(&self, _model: &ModelRef) -> Result<(), SessionError> {
        Ok(())
    }
}

#[derive(Default)]
struct Outbox(Mutex<Vec<(String, String)>>);

#[async_trait]
impl ChannelSender for Outbox {
    async fn send(&self, target: &str, text: &str, _options: &SendOptions) -> anyhow::Result<()> {
        self.0
            .lock()
            .expect("outbox")
            .push((target.to_string(), text.to_string()));
        Ok(())
    }
}

struct Silent;

#[async_trait]
impl Notifier for Silent {
    async fn notify_priority(&self, _text: &str) {}
}

struct NoopObserver;

#[async_trait]
impl TurnObserver for NoopObserver {}

struct Gateway {
    store: Arc<SqliteStore>,
    queue: CommandQueue,
    session: Arc<ScriptedSession>,
    outbox: Arc<Outbox>,
}

async fn boot(db_path: &Path, hang_on: &[&str]) -> Gateway {
    let store = Arc::new(SqliteStore::open(db_path, StreamConfig::default()).expect("open store"));
    store.ensure_group().await.expect("group");
    let (events_tx, events_rx) = mpsc::channel(64);
    let session = Arc::new(ScriptedSession::new(events_tx, hang_on));
    let observer = Arc::new(NoopObserver);
    let config = CommandQueueConfig {
        idle_timeout: Duration::from_secs(30),
        ..CommandQueueConfig::default()
    };
    let queue = CommandQueue::new(
        config,
        store.clone(),
        session.clone(),
        observer.clone(),
        Arc::new(IdleGate::new()),
    );
    let outbox = Arc::new(Outbox::default());
    let dispatcher =
        SessionEventDispatcher::new(queue.clone(), outbox.clone(), Arc::new(Silent), observer);
    tokio::spawn(dispatcher.run(events_rx));
    Gateway {
        store,
        queue,
        session,
        outbox,
    }
}

async fn accept(gateway: &Gateway, source: &str, prompt: &str) {
    let stream_id = gateway
        .store
        .persist(&InboundItem::new(source, prompt))
        .await
        .expect("persist");
    gateway
        .queue
        .submit(InboundItem::new(source, prompt).with_stream_id(stream_id));
}

async fn wait_until_empty(store: &SqliteStore) {
    for _ in 0..200 {
        if store.peek_unacked().await.expect("peek").is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("log still holds unacknowledged entries");
}

#[tokio::test]
async fn integration_entries_accepted_before_start_replay_after_restart() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("vigil.sqlite");

    let first = boot(&db_path, &[]).await;
    accept(&first, "telegram:1", "first").await;
    accept(&first, "telegram:2", "second").await;
    assert!(first.session.prompts().is_empty());
    drop(first);

    let second = boot(&db_path, &[]).await;
    assert_eq!(second.queue.replay_unacked().await.expect("replay"), 2);
    second.queue.start().await;
    wait_until_empty(&second.store).await;

    assert_eq!(second.session.prompts(), vec!["first", "second"]);
    let delivered = second.outbox.0.lock().expect("outbox").clone();
    assert_eq!(
        delivered,
        vec![
            ("telegram:1".to_string(), "done: first".to_string()),
            ("telegram:2".to_string(), "done: second".to_string()),
        ]
    );
}

#[tokio::test]
async fn integration_crash_mid_turn_replays_only_the_unfinished_entry() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("vigil.sqlite");

    let first = boot(&db_path, &["second"]).await;
    let _drain = first.queue.start();
    accept(&first, "telegram:1", "first").await;
    accept(&first, "telegram:1", "second").await;
    for _ in 0..200 {
        if first.session.prompts().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(first.session.prompts(), vec!["first", "second"]);
    let pending = first.store.peek_unacked().await.expect("peek");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].prompt, "second");
    let _ = first.queue.stop();

    let second = boot(&db_path, &[]).await;
    assert_eq!(second.queue.replay_unacked().await.expect("replay"), 1);
    second.queue.start().await;
    wait_until_empty(&second.store).await;
    assert_eq!(second.session.prompts(), vec!["second"]);
}

#[tokio::test]
async fn regression_redelivered_duplicate_is_acked_without_a_second_turn() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("vigil.sqlite");
    let gateway = boot(&db_path, &[]).await;

    accept(&gateway, "telegram:1", "hello").await;
    let duplicate_id = gateway
        .store
        .persist(&InboundItem::new("telegram:1", "hello"))
        .await
        .expect("persist");
    let outcome = gateway
        .queue
        .submit(InboundItem::new("telegram:1", "hello").with_stream_id(duplicate_id.clone()));
    assert_eq!(outcome, vigil_runtime::EnqueueOutcome::Duplicate);
    assert!(gateway.store.ack(&duplicate_id).await.expect("ack"));

    gateway.queue.start().await;
    wait_until_empty(&gateway.store).await;
    assert_eq!(gateway.session.prompts(), vec!["hello"]);
}
