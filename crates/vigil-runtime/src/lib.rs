//! In-process reliability machinery around the single agent session.
//!
//! [`CommandQueue`] is the single-flight drain loop, [`SessionEventDispatcher`]
//! consumes the session's lifecycle stream and resolves the [`IdleGate`],
//! [`FallbackController`] swaps models on sustained trouble, and [`Watchdog`]
//! aborts stuck turns and requests a restart once the session is dead.

mod command_queue;
mod failure_counter;
mod fallback;
mod idle_gate;
mod session_dispatch;
mod status;
mod tripwire;
mod turn_clock;
mod watchdog;

pub use command_queue::{
    strip_channel_preamble, CommandQueue, CommandQueueConfig, DrainHandle, EnqueueOutcome,
    QueueSnapshot,
};
pub use failure_counter::FailureCounter;
pub use fallback::{
    FallbackConfig, FallbackController, FallbackEventSink, FallbackState, PrimaryProbe,
    TurnObserver,
};
pub use idle_gate::{IdleGate, IdleWait, TurnOutcome, WaitOutcome};
pub use session_dispatch::SessionEventDispatcher;
pub use status::{inspect_status, WatchdogReport, STATUS_SCHEMA_VERSION};
pub use tripwire::{
    read_tripwire, start_tripwire, write_tripwire, TripwireConfig, TripwireHandle,
    TripwireRecord,
};
pub use turn_clock::TurnClock;
pub use watchdog::{GracefulShutdown, Watchdog, WatchdogAction, WatchdogConfig};

pub(crate) type ClockFn = std::sync::Arc<dyn Fn() -> u64 + Send + Sync>;

pub(crate) use vigil_core::lock_or_recover;
