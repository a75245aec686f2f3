use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vigil_core::{
    current_unix_timestamp_ms, ChannelSender, Notifier, SendOptions, SessionEvent, DEFAULT_SOURCE,
};

use crate::{CommandQueue, IdleGate, TurnClock, TurnObserver, TurnOutcome};

/// Single consumer of the session's lifecycle stream.
///
/// Every event counts as activity for the fallback timeout. `turn_end`
/// routes the accumulated reply to the active source and opens the idle
/// gate; `error` opens it with a failure and pages the operator.
pub struct SessionEventDispatcher {
    queue: CommandQueue,
    gate: Arc<IdleGate>,
    turn_clock: TurnClock,
    channels: Arc<dyn ChannelSender>,
    notifier: Arc<dyn Notifier>,
    observer: Arc<dyn TurnObserver>,
    reply: String,
}

impl SessionEventDispatcher {
    pub fn new(
        queue: CommandQueue,
        channels: Arc<dyn ChannelSender>,
        notifier: Arc<dyn Notifier>,
        observer: Arc<dyn TurnObserver>,
    ) -> Self {
        Self {
            gate: queue.gate(),
            turn_clock: queue.turn_clock(),
            queue,
            channels,
            notifier,
            observer,
            reply: String::new(),
        }
    }

    /// Consumes events until every sender is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }
        info!("session event stream closed");
    }

    pub async fn handle(&mut self, event: SessionEvent) {
        self.observer.on_activity().await;
        match event {
            SessionEvent::MessageStart => {
                if !self.reply.is_empty() && !self.reply.ends_with("\n\n") {
                    self.reply.push_str("\n\n");
                }
            }
            SessionEvent::TextDelta { delta } => self.reply.push_str(&delta),
            SessionEvent::ToolCall { name, .. } => debug!(tool = %name, "session tool call"),
            SessionEvent::ToolResult { name, is_error } => {
                debug!(tool = %name, is_error, "session tool result")
            }
            SessionEvent::CompactionStart => self.observer.pause_timeout_watch().await,
            SessionEvent::CompactionEnd => self.observer.resume_timeout_watch().await,
            SessionEvent::TurnEnd => {
                self.turn_clock.mark_completion(current_unix_timestamp_ms());
                self.deliver_reply().await;
                if !self.gate.resolve(TurnOutcome::Completed) {
                    debug!("turn_end arrived with no armed idle gate");
                }
            }
            SessionEvent::Error { message } => {
                self.turn_clock.mark_completion(current_unix_timestamp_ms());
                self.reply.clear();
                warn!(error = %message, "session reported a runtime error");
                self.notifier
                    .notify_priority(&format!("Agent session error: {message}"))
                    .await;
                self.gate.resolve(TurnOutcome::Failed(message));
            }
        }
    }

    async fn deliver_reply(&mut self) {
        let reply = std::mem::take(&mut self.reply);
        let text = reply.trim();
        if text.is_empty() {
            return;
        }
        let target = self
            .queue
            .active_source()
            .unwrap_or_else(|| DEFAULT_SOURCE.to_string());
        if let Err(error) = self
            .channels
            .send(&target, text, &SendOptions::default())
            .await
        {
            warn!(target = %target, error = %error, "failed to deliver agent reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SessionEventDispatcher;
    use crate::fallback::tests::{ModelRecorder, NotifyRecorder};
    use crate::{
        CommandQueue, CommandQueueConfig, IdleGate, TurnObserver, TurnOutcome, WaitOutcome,
    };
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use vigil_core::{ChannelSender, InboundItem, SendOptions, SessionEvent};
    use vigil_store::InMemoryDurableLog;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, String)>>);

    #[async_trait]
    impl ChannelSender for Outbox {
        async fn send(
            &self,
            target: &str,
            text: &str,
            _options: &SendOptions,
        ) -> anyhow::Result<()> {
            self.0
                .lock()
                .expect("outbox")
                .push((target.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct HookLog(Mutex<Vec<&'static str>>);

    #[async_trait]
    impl TurnObserver for HookLog {
        async fn on_activity(&self) {
            self.0.lock().expect("hooks").push("activity");
        }

        async fn pause_timeout_watch(&self) {
            self.0.lock().expect("hooks").push("pause");
        }

        async fn resume_timeout_watch(&self) {
            self.0.lock().expect("hooks").push("resume");
        }
    }

    struct Harness {
        queue: CommandQueue,
        outbox: Arc<Outbox>,
        notes: Arc<NotifyRecorder>,
        hooks: Arc<HookLog>,
        dispatcher: SessionEventDispatcher,
    }

    fn harness() -> Harness {
        let hooks = Arc::new(HookLog::default());
        let queue = CommandQueue::new(
            CommandQueueConfig::default(),
            Arc::new(InMemoryDurableLog::new()),
            Arc::new(ModelRecorder::default()),
            hooks.clone(),
            Arc::new(IdleGate::new()),
        );
        let outbox = Arc::new(Outbox::default());
        let notes = Arc::new(NotifyRecorder::default());
        let dispatcher = SessionEventDispatcher::new(
            queue.clone(),
            outbox.clone(),
            notes.clone(),
            hooks.clone(),
        );
        Harness {
            queue,
            outbox,
            notes,
            hooks,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn integration_turn_reply_routes_to_active_source_and_opens_gate() {
        let mut h = harness();
        h.queue.enqueue(InboundItem::new("telegram:42", "hi"));
        let drain = h.queue.start();
        for _ in 0..50 {
            if h.queue.active_source().is_some() && h.queue.gate().is_armed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        for event in [
            SessionEvent::MessageStart,
            SessionEvent::TextDelta {
                delta: "Hello".to_string(),
            },
            SessionEvent::TextDelta {
                delta: " there".to_string(),
            },
            SessionEvent::TurnEnd,
        ] {
            h.dispatcher.handle(event).await;
        }
        tokio::time::timeout(Duration::from_secs(1), drain)
            .await
            .expect("turn end releases the drain loop");

        assert_eq!(
            *h.outbox.0.lock().expect("outbox"),
            vec![("telegram:42".to_string(), "Hello there".to_string())]
        );
        assert_eq!(h.queue.failures().current(), 0);
        assert!(h.hooks.0.lock().expect("hooks").contains(&"activity"));
    }

    #[tokio::test]
    async fn functional_error_event_fails_turn_and_notifies_operator() {
        let mut h = harness();
        let wait = h.queue.gate().arm();
        h.dispatcher
            .handle(SessionEvent::TextDelta {
                delta: "partial".to_string(),
            })
            .await;
        h.dispatcher
            .handle(SessionEvent::Error {
                message: "529 overloaded".to_string(),
            })
            .await;
        assert_eq!(
            wait.wait(Duration::from_secs(1)).await,
            WaitOutcome::Turn(TurnOutcome::Failed("529 overloaded".to_string()))
        );
        assert!(h.outbox.0.lock().expect("outbox").is_empty());
        assert_eq!(
            *h.notes.0.lock().expect("notes"),
            vec!["Agent session error: 529 overloaded".to_string()]
        );
    }

    #[tokio::test]
    async fn unit_compaction_brackets_pause_and_resume_timeout_watch() {
        let mut h = harness();
        h.dispatcher.handle(SessionEvent::CompactionStart).await;
        h.dispatcher.handle(SessionEvent::CompactionEnd).await;
        assert_eq!(
            *h.hooks.0.lock().expect("hooks"),
            vec!["activity", "pause", "activity", "resume"]
        );
    }
}
