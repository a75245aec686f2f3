use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::lock_or_recover;

/// How the session reported the end of a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(String),
}

/// Result of waiting on an armed gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Turn(TurnOutcome),
    TimedOut,
    /// The gate was re-armed or dropped before the turn ended.
    Abandoned,
}

/// One-shot "session is idle again" signal, armed by the drain loop before
/// each prompt and resolved by the session event dispatcher.
#[derive(Debug, Default)]
pub struct IdleGate {
    next_turn: AtomicU64,
    armed: Mutex<Option<(u64, oneshot::Sender<TurnOutcome>)>>,
}

/// The drain loop's side of an armed gate.
#[derive(Debug)]
pub struct IdleWait {
    turn_id: u64,
    receiver: oneshot::Receiver<TurnOutcome>,
}

impl IdleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the gate for a new turn, abandoning any previous waiter.
    pub fn arm(&self) -> IdleWait {
        let turn_id = self.next_turn.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        let (sender, receiver) = oneshot::channel();
        *lock_or_recover(&self.armed) = Some((turn_id, sender));
        IdleWait { turn_id, receiver }
    }

    /// Resolves the armed turn; returns false when nothing was waiting.
    pub fn resolve(&self, outcome: TurnOutcome) -> bool {
        let armed = lock_or_recover(&self.armed).take();
        match armed {
            Some((_, sender)) => sender.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Disarms `turn_id` if it is still the armed turn.
    pub fn disarm(&self, turn_id: u64) {
        let mut armed = lock_or_recover(&self.armed);
        if armed.as_ref().is_some_and(|(armed_id, _)| *armed_id == turn_id) {
            armed.take();
        }
    }

    pub fn is_armed(&self) -> bool {
        lock_or_recover(&self.armed).is_some()
    }
}

impl IdleWait {
    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    /// Races the session's signal against the safety timeout.
    pub async fn wait(self, safety_timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(safety_timeout, self.receiver).await {
            Ok(Ok(outcome)) => WaitOutcome::Turn(outcome),
            Ok(Err(_)) => WaitOutcome::Abandoned,
            Err(_) => WaitOutcome::TimedOut,
        }
    }
}
