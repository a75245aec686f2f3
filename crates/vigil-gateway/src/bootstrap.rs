use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vigil_core::{ChannelSender, Notifier};
use vigil_resilience::{
    run_with_reconnect, shutdown_channel, ConnectionSupervisor, SelfHeal, ShutdownSignal,
    ShutdownTrigger,
};
use vigil_runtime::{
    start_tripwire, CommandQueue, FallbackController, FallbackEventSink, GracefulShutdown,
    IdleGate, PrimaryProbe, SessionEventDispatcher, TurnObserver, Watchdog,
};
use vigil_store::{DurableLog, EventBus, ModeStore, SqliteStore};
use vigil_triage::EventTriage;

use crate::bus_listener::{run_digest_timer, BusListener};
use crate::channels::{ChannelRouter, ConsoleChannel, OperatorNotifier};
use crate::config::GatewayConfig;
use crate::heal::HealCommand;
use crate::ingress::{bind_ingress, serve_ingress, IngressState, QueueSink};
use crate::probe::{CooldownProbe, HttpPrimaryProbe};
use crate::process_session::{ProcessAgentSession, ProcessSessionConnector};

const SESSION_EVENT_BUFFER: usize = 256;
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayExit {
    /// Operator interrupt or termination signal.
    Interrupted,
    /// The watchdog declared the session dead; a supervisor should restart us.
    DeadSession,
}

impl GatewayExit {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Interrupted => ExitCode::SUCCESS,
            Self::DeadSession => ExitCode::from(75),
        }
    }
}

/// Watchdog-facing shutdown: flags the dead-session exit and fires the trigger.
struct RestartRequest {
    trigger: ShutdownTrigger,
    requested: AtomicBool,
}

impl RestartRequest {
    fn new(trigger: ShutdownTrigger) -> Self {
        Self {
            trigger,
            requested: AtomicBool::new(false),
        }
    }

    fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GracefulShutdown for RestartRequest {
    async fn shutdown(&self, reason: &str) {
        warn!(reason, "gateway restart requested");
        self.requested.store(true, Ordering::SeqCst);
        self.trigger.trigger();
    }
}

struct PrimaryOnly;

impl TurnObserver for PrimaryOnly {}

/// Wired components of a running gateway.
pub struct GatewayContext {
    pub config: GatewayConfig,
    pub store: Arc<SqliteStore>,
    pub channels: Arc<dyn ChannelSender>,
    pub notifier: Arc<dyn Notifier>,
    pub session: ProcessAgentSession,
    pub fallback: Option<FallbackController>,
    pub queue: CommandQueue,
    pub triage: Arc<EventTriage>,
}

impl GatewayContext {
    pub async fn build(config: GatewayConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(config.database_path(), config.stream.clone()).with_context(
                || format!("failed to open store {}", config.database_path().display()),
            )?,
        );
        store
            .ensure_group()
            .await
            .context("failed to initialize consumer group")?;

        let console: Arc<dyn ChannelSender> = Arc::new(ConsoleChannel::new());
        let channels: Arc<dyn ChannelSender> =
            Arc::new(ChannelRouter::new(console.clone()).register("console", console));
        let notifier: Arc<dyn Notifier> = Arc::new(OperatorNotifier::new(
            channels.clone(),
            config.operator_target.clone(),
        ));
        let session = ProcessAgentSession::new(config.session.ack_timeout)
            .with_initial_model(config.primary_model.clone());

        let fallback = match &config.fallback {
            Some(fallback_config) => {
                let probe: Arc<dyn PrimaryProbe> = match &config.primary_health_url {
                    Some(url) => Arc::new(HttpPrimaryProbe::new(url.clone())?),
                    None => Arc::new(CooldownProbe::new(fallback_config.probe_interval)),
                };
                let sink: FallbackEventSink = Arc::new(|event: Value| {
                    info!(event = %event, "model fallback event");
                });
                Some(FallbackController::new(
                    fallback_config.clone(),
                    Arc::new(session.clone()),
                    notifier.clone(),
                    probe,
                    Some(sink),
                ))
            }
            None => None,
        };
        let queue = CommandQueue::new(
            config.queue,
            store.clone(),
            Arc::new(session.clone()),
            turn_observer(fallback.as_ref()),
            Arc::new(IdleGate::new()),
        );
        let triage = Arc::new(EventTriage::new(
            config.triage.clone(),
            store.clone(),
            store.clone(),
            Arc::new(QueueSink::new(store.clone(), queue.clone())),
            notifier.clone(),
        ));

        Ok(Self {
            config,
            store,
            channels,
            notifier,
            session,
            fallback,
            queue,
            triage,
        })
    }

    fn observer(&self) -> Arc<dyn TurnObserver> {
        turn_observer(self.fallback.as_ref())
    }
}

fn turn_observer(fallback: Option<&FallbackController>) -> Arc<dyn TurnObserver> {
    match fallback {
        Some(controller) => Arc::new(controller.clone()),
        None => Arc::new(PrimaryOnly),
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    warn!(error = %error, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn run_log_maintenance(
    log: Arc<dyn DurableLog>,
    max_age: Duration,
    interval: Duration,
    mut shutdown: ShutdownSignal,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => match log.trim_old(max_age).await {
                Ok(deleted) => info!(deleted, "trimmed acknowledged log entries"),
                Err(error) => warn!(error = %error, "log trim failed"),
            },
            _ = shutdown.wait() => break,
        }
    }
}

/// Replays unacknowledged entries and starts the drain loop once the agent
/// session is connected. Gives up quietly when shutdown wins the race.
async fn start_queue_when_connected(
    queue: CommandQueue,
    mut connected: watch::Receiver<bool>,
    connect_timeout: Duration,
    mut shutdown: ShutdownSignal,
) {
    let timeout_ms = u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX);
    loop {
        let ready = async {
            while !*connected.borrow_and_update() {
                connected.changed().await?;
            }
            Ok::<(), watch::error::RecvError>(())
        };
        tokio::select! {
            outcome = tokio::time::timeout(connect_timeout, ready) => match outcome {
                Ok(Ok(())) => break,
                Ok(Err(_)) => {
                    warn!("agent session handle dropped before connecting");
                    return;
                }
                Err(_) => warn!(timeout_ms, "agent session not connected yet; holding replay"),
            },
            _ = shutdown.wait() => return,
        }
    }
    match queue.replay_unacked().await {
        Ok(replayed) => info!(replayed, "startup replay complete"),
        Err(error) => warn!(error = %error, "startup replay failed; continuing with live traffic"),
    }
    let _drain = queue.start();
}

/// Waits up to `grace` for the in-flight turn, then stops the agent session.
/// Returns false when the turn was cut off.
async fn finish_turn_then_stop_session(
    queue: &CommandQueue,
    grace: Duration,
    session_trigger: &ShutdownTrigger,
) -> bool {
    let finished = match queue.stop() {
        Some(drain) => tokio::time::timeout(grace, drain).await.is_ok(),
        None => true,
    };
    if !finished {
        warn!(
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "in-flight turn did not finish in time; it will replay on next start"
        );
    }
    session_trigger.trigger();
    finished
}

/// Startup sequence, steady state, and graceful shutdown of `vigil run`.
pub async fn run_gateway(config: GatewayConfig) -> Result<GatewayExit> {
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "failed to create state directory {}",
            config.state_dir.display()
        )
    })?;
    let context = GatewayContext::build(config).await?;
    let config = &context.config;
    let (trigger, signal) = shutdown_channel();
    let restart = Arc::new(RestartRequest::new(trigger.clone()));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_BUFFER);
    let mut session_connector =
        ProcessSessionConnector::new(&config.session, context.session.clone(), events_tx);
    let heal: Option<Arc<dyn SelfHeal>> = config
        .heal
        .clone()
        .map(|heal_config| Arc::new(HealCommand::new(heal_config)) as Arc<dyn SelfHeal>);
    let mut session_supervisor =
        ConnectionSupervisor::new("agent-session", config.backoff, config.self_heal);
    // Stopped separately, after the in-flight turn.
    let (session_trigger, session_signal) = shutdown_channel();
    tasks.push(tokio::spawn(async move {
        run_with_reconnect(
            &mut session_connector,
            &mut session_supervisor,
            heal.as_deref(),
            session_signal,
        )
        .await;
    }));

    let dispatcher = SessionEventDispatcher::new(
        context.queue.clone(),
        context.channels.clone(),
        context.notifier.clone(),
        context.observer(),
    );
    tokio::spawn(dispatcher.run(events_rx));

    let log: Arc<dyn DurableLog> = context.store.clone();
    let bus: Arc<dyn EventBus> = context.store.clone();
    let modes: Arc<dyn ModeStore> = context.store.clone();

    let listener = bind_ingress(config.bind).await?;
    let ingress_state = Arc::new(IngressState {
        log: log.clone(),
        bus: bus.clone(),
        modes: modes.clone(),
        queue: context.queue.clone(),
        triage: context.triage.clone(),
    });
    let ingress_signal = signal.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(error) = serve_ingress(listener, ingress_state, ingress_signal).await {
            error!(error = %error, "ingress stopped");
        }
    }));

    let mut bus_listener = BusListener::new(bus.clone(), context.triage.clone());
    let mut bus_supervisor =
        ConnectionSupervisor::new("event-bus", config.backoff, config.self_heal);
    let bus_signal = signal.clone();
    tasks.push(tokio::spawn(async move {
        run_with_reconnect(&mut bus_listener, &mut bus_supervisor, None, bus_signal).await;
    }));

    let mut watchdog = Watchdog::new(
        config.watchdog.clone(),
        context.queue.clone(),
        Arc::new(context.session.clone()),
        log.clone(),
        bus.clone(),
        modes.clone(),
        context.notifier.clone(),
        restart.clone(),
    );
    if let Some(controller) = &context.fallback {
        watchdog = watchdog.with_fallback(controller.clone());
    }
    tasks.push(tokio::spawn(Arc::new(watchdog).run(signal.clone())));
    let mut tripwire = start_tripwire(config.tripwire.clone())?;
    tasks.push(tokio::spawn(run_digest_timer(
        context.triage.clone(),
        config.triage.digest_interval,
        signal.clone(),
    )));
    tasks.push(tokio::spawn(run_log_maintenance(
        log.clone(),
        config.log_max_age,
        config.trim_interval,
        signal.clone(),
    )));
    tasks.push(tokio::spawn(start_queue_when_connected(
        context.queue.clone(),
        context.session.connection_watch(),
        config.session.connect_timeout,
        signal.clone(),
    )));
    info!(
        bind = %config.bind,
        state_dir = %config.state_dir.display(),
        fallback = context.fallback.is_some(),
        "gateway started"
    );

    let mut stop_signal = signal.clone();
    tokio::select! {
        _ = wait_for_termination() => info!("termination signal received"),
        _ = stop_signal.wait() => {}
    }
    trigger.trigger();
    finish_turn_then_stop_session(&context.queue, config.shutdown_grace, &session_trigger).await;
    tripwire.shutdown().await;
    for task in tasks {
        if tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await.is_err() {
            warn!("background task did not stop in time");
        }
    }

    let exit = if restart.requested() {
        GatewayExit::DeadSession
    } else {
        GatewayExit::Interrupted
    };
    info!(
        exit = ?exit,
        queued = context.queue.depth(),
        "gateway stopped; queued items remain in the durable log"
    );
    Ok(exit)
}
