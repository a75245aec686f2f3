//! Agent session hosted in a long-lived child process speaking NDJSON over stdio.
//!
//! Commands go to stdin as `{"type":"prompt"|"abort"|"set_model","id",...}` and
//! are answered on stdout by `{"type":"ack","id"}` or `{"type":"nack","id","error"}`.
//! Every other stdout line is a lifecycle [`SessionEvent`]. The child is a
//! [`Connector`]: when it exits it is respawned with backoff and every
//! outstanding command fails at once.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vigil_core::{
    lock_or_recover, parse_session_event_line, AgentSession, ModelRef, SessionError, SessionEvent,
};
use vigil_resilience::{ConnectionError, Connector, PendingRequests};

use crate::config::SessionProcessConfig;

type CommandReply = Result<(), String>;

struct SessionShared {
    pending: PendingRequests<CommandReply>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    ack_timeout: Duration,
    current_model: Mutex<Option<ModelRef>>,
    connected: watch::Sender<bool>,
}

/// Caller-side handle; cheap to clone and valid across child restarts.
#[derive(Clone)]
pub struct ProcessAgentSession {
    shared: Arc<SessionShared>,
}

impl ProcessAgentSession {
    pub fn new(ack_timeout: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            shared: Arc::new(SessionShared {
                pending: PendingRequests::new("cmd"),
                stdin: tokio::sync::Mutex::new(None),
                ack_timeout,
                current_model: Mutex::new(None),
                connected,
            }),
        }
    }

    /// Model applied to every (re)spawned child until `set_model` changes it.
    pub fn with_initial_model(self, model: ModelRef) -> Self {
        *lock_or_recover(&self.shared.current_model) = Some(model);
        self
    }

    /// Flips to `true` once a spawned child has been resubscribed, and back
    /// to `false` when it exits.
    pub fn connection_watch(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.stdin.lock().await.is_some()
    }

    pub fn outstanding_commands(&self) -> usize {
        self.shared.pending.len()
    }

    async fn send_command(&self, kind: &str, fields: Value) -> Result<(), SessionError> {
        let (id, receiver) = self.shared.pending.register();
        let mut command = json!({ "type": kind, "id": id });
        if let (Some(target), Value::Object(extra)) = (command.as_object_mut(), fields) {
            target.extend(extra);
        }
        if let Err(error) = self.write_line(&command).await {
            self.shared.pending.forget(&id);
            return Err(error);
        }
        match self
            .shared
            .pending
            .wait(&id, receiver, self.shared.ack_timeout)
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(SessionError::Rejected(reason)),
            Err(ConnectionError::Timeout(ms)) => Err(SessionError::Timeout(ms)),
            Err(ConnectionError::Disconnected(reason)) | Err(ConnectionError::Connect(reason)) => {
                Err(SessionError::Unavailable(reason))
            }
            Err(error) => Err(SessionError::Transport(error.to_string())),
        }
    }

    async fn write_line(&self, command: &Value) -> Result<(), SessionError> {
        let mut line = serde_json::to_string(command)
            .map_err(|error| SessionError::Transport(error.to_string()))?;
        line.push('\n');
        let mut stdin = self.shared.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(SessionError::Unavailable(
                "agent process is not running".to_string(),
            ));
        };
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|error| SessionError::Transport(error.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|error| SessionError::Transport(error.to_string()))
    }
}

#[async_trait]
impl AgentSession for ProcessAgentSession {
    async fn prompt(&self, text: &str) -> Result<(), SessionError> {
        self.send_command("prompt", json!({ "text": text })).await
    }

    async fn abort(&self) -> Result<(), SessionError> {
        self.send_command("abort", json!({})).await
    }

    async fn set_model(&self, model: &ModelRef) -> Result<(), SessionError> {
        self.send_command("set_model", json!({ "model": model.to_string() }))
            .await?;
        *lock_or_recover(&self.shared.current_model) = Some(model.clone());
        Ok(())
    }
}

pub struct ProcessLink {
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Spawns and serves the child process on behalf of [`ProcessAgentSession`].
pub struct ProcessSessionConnector {
    argv: Vec<String>,
    session: ProcessAgentSession,
    events: mpsc::Sender<SessionEvent>,
    restarts: u64,
}

impl ProcessSessionConnector {
    pub fn new(
        config: &SessionProcessConfig,
        session: ProcessAgentSession,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            argv: config.argv.clone(),
            session,
            events,
            restarts: 0,
        }
    }

    async fn handle_line(&self, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            if !line.trim().is_empty() {
                debug!(line = %line, "ignoring non-json agent output");
            }
            return;
        };
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let id = value.get("id").and_then(Value::as_str);
        match (kind, id) {
            ("ack", Some(id)) => {
                if !self.session.shared.pending.resolve(id, Ok(Ok(()))) {
                    debug!(id, "ack for unknown command");
                }
            }
            ("nack", Some(id)) => {
                let reason = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("command rejected")
                    .to_string();
                if !self.session.shared.pending.resolve(id, Ok(Err(reason))) {
                    debug!(id, "nack for unknown command");
                }
            }
            _ => match parse_session_event_line(line) {
                Some(event) => {
                    if self.events.send(event).await.is_err() {
                        warn!("session event consumer is gone");
                    }
                }
                None => debug!(kind, "ignoring unrecognized agent output"),
            },
        }
    }

    async fn on_disconnect(&self, reason: String) {
        self.session.shared.stdin.lock().await.take();
        self.session.shared.connected.send_replace(false);
        let failed = self
            .session
            .shared
            .pending
            .fail_all(&ConnectionError::Disconnected(reason.clone()));
        if failed > 0 {
            warn!(failed, "failed outstanding agent commands on disconnect");
        }
        // Fails the in-flight turn, if any.
        let _ = self
            .events
            .send(SessionEvent::Error {
                message: format!("agent process disconnected: {reason}"),
            })
            .await;
    }
}

fn describe_exit(status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match status.code() {
            Some(code) => format!("agent process exited with status {code}"),
            None => "agent process terminated by signal".to_string(),
        },
        Err(error) => format!("failed to reap agent process: {error}"),
    }
}

#[async_trait]
impl Connector for ProcessSessionConnector {
    type Link = ProcessLink;

    async fn connect(&mut self) -> Result<ProcessLink, ConnectionError> {
        let Some((program, args)) = self.argv.split_first() else {
            return Err(ConnectionError::Connect("empty session command".to_string()));
        };
        let mut command = Command::new(program);
        command.kill_on_drop(true);
        command.args(args);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::inherit());
        let mut child = command.spawn().map_err(|error| {
            ConnectionError::Connect(format!("failed to spawn '{program}': {error}"))
        })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ConnectionError::Connect(
                "agent process stdio was not captured".to_string(),
            ));
        };
        *self.session.shared.stdin.lock().await = Some(stdin);
        self.restarts = self.restarts.saturating_add(1);
        info!(
            program = %program,
            pid = child.id().unwrap_or_default(),
            spawns = self.restarts,
            "agent process started"
        );
        Ok(ProcessLink {
            child,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn resubscribe(&mut self, _link: &mut ProcessLink) -> Result<(), ConnectionError> {
        let model = lock_or_recover(&self.session.shared.current_model).clone();
        let Some(model) = model else {
            self.session.shared.connected.send_replace(true);
            return Ok(());
        };
        // The ack is read by `serve`, so the replayed model switch is fire-and-forget.
        let command = json!({
            "type": "set_model",
            "id": format!("resubscribe-{}", self.restarts),
            "model": model.to_string(),
        });
        self.session
            .write_line(&command)
            .await
            .map_err(|error| ConnectionError::Connect(error.to_string()))?;
        info!(model = %model, "applied active model to agent process");
        self.session.shared.connected.send_replace(true);
        Ok(())
    }

    async fn serve(&mut self, mut link: ProcessLink) -> Result<(), ConnectionError> {
        let reason = loop {
            match link.stdout.next_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => break describe_exit(link.child.wait().await),
                Err(error) => {
                    let _ = link.child.start_kill();
                    break format!("failed to read agent output: {error}");
                }
            }
        };
        self.on_disconnect(reason.clone()).await;
        Err(ConnectionError::Disconnected(reason))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::{ProcessAgentSession, ProcessSessionConnector};
    use crate::config::SessionProcessConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use vigil_core::{AgentSession, ModelRef, SessionError, SessionEvent};
    use vigil_resilience::Connector;

    const ECHO_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"type":"prompt"'*)
      printf '{"type":"ack","id":"%s"}\n' "$id"
      printf '{"type":"message_start"}\n{"type":"text_delta","delta":"pong"}\n{"type":"turn_end"}\n'
      ;;
    *'"type":"set_model"'*)
      printf '{"type":"nack","id":"%s","error":"unknown model"}\n' "$id"
      ;;
    *)
      printf '{"type":"ack","id":"%s"}\n' "$id"
      ;;
  esac
done
"#;

    fn config(script: &str) -> SessionProcessConfig {
        SessionProcessConfig {
            argv: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn integration_prompt_is_acked_and_lifecycle_events_stream_out() {
        let session = ProcessAgentSession::new(Duration::from_secs(5));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut connector =
            ProcessSessionConnector::new(&config(ECHO_AGENT), session.clone(), events_tx);
        let mut link = connector.connect().await.expect("spawn");
        connector.resubscribe(&mut link).await.expect("resubscribe");
        let serving = tokio::spawn(async move { connector.serve(link).await });

        session.prompt("ping").await.expect("prompt acked");
        let mut seen = Vec::new();
        while let Some(event) = events_rx.recv().await {
            let done = event == SessionEvent::TurnEnd;
            seen.push(event);
            if done {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                SessionEvent::MessageStart,
                SessionEvent::TextDelta {
                    delta: "pong".to_string()
                },
                SessionEvent::TurnEnd,
            ]
        );

        let rejected = session
            .set_model(&ModelRef::new("openai", "nope"))
            .await
            .expect_err("nack");
        assert_eq!(rejected, SessionError::Rejected("unknown model".to_string()));
        assert_eq!(session.outstanding_commands(), 0);
        serving.abort();
    }

    #[tokio::test]
    async fn functional_initial_model_is_applied_on_connect_and_tracked_by_the_watch() {
        let session = ProcessAgentSession::new(Duration::from_secs(5))
            .with_initial_model(ModelRef::new("anthropic", "claude-sonnet-4"));
        let connected = session.connection_watch();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let script = r#"
read -r line
model=$(printf '%s' "$line" | sed -n 's/.*"model":"\([^"]*\)".*/\1/p')
printf '{"type":"text_delta","delta":"%s"}\n' "$model"
"#;
        let mut connector = ProcessSessionConnector::new(&config(script), session, events_tx);
        let mut link = connector.connect().await.expect("spawn");
        assert!(!*connected.borrow());
        connector.resubscribe(&mut link).await.expect("resubscribe");
        assert!(*connected.borrow());

        let outcome = connector.serve(link).await;
        assert!(outcome.is_err());
        assert_eq!(
            events_rx.recv().await,
            Some(SessionEvent::TextDelta {
                delta: "anthropic/claude-sonnet-4".to_string()
            })
        );
        assert!(!*connected.borrow());
    }

    #[tokio::test]
    async fn regression_child_exit_fails_outstanding_commands_immediately() {
        let session = ProcessAgentSession::new(Duration::from_secs(30));
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let mut connector = ProcessSessionConnector::new(
            &config("read -r line; exit 7"),
            session.clone(),
            events_tx,
        );
        let link = connector.connect().await.expect("spawn");
        let serving = tokio::spawn(async move { connector.serve(link).await });

        let started = tokio::time::Instant::now();
        let error = session.prompt("hello").await.expect_err("disconnect");
        assert!(matches!(error, SessionError::Unavailable(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        let outcome = serving.await.expect("join");
        assert!(outcome.is_err());
        assert!(!session.is_connected().await);
        assert!(matches!(
            events_rx.recv().await,
            Some(SessionEvent::Error { .. })
        ));
        assert!(matches!(
            session.abort().await,
            Err(SessionError::Unavailable(_))
        ));
    }
}
