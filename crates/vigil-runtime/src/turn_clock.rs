use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Dispatch/completion timestamps shared by the queue, the session
/// dispatcher, and the watchdog. Zero means "never".
#[derive(Debug, Clone, Default)]
pub struct TurnClock {
    last_dispatch_unix_ms: Arc<AtomicU64>,
    last_completion_unix_ms: Arc<AtomicU64>,
}

impl TurnClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dispatch(&self, now_unix_ms: u64) {
        self.last_dispatch_unix_ms
            .store(now_unix_ms, Ordering::SeqCst);
    }

    pub fn mark_completion(&self, now_unix_ms: u64) {
        self.last_completion_unix_ms
            .store(now_unix_ms, Ordering::SeqCst);
    }

    pub fn last_dispatch_unix_ms(&self) -> u64 {
        self.last_dispatch_unix_ms.load(Ordering::SeqCst)
    }

    pub fn last_completion_unix_ms(&self) -> u64 {
        self.last_completion_unix_ms.load(Ordering::SeqCst)
    }

    /// How long the current turn has been running, when a dispatch is newer
    /// than the last completion.
    pub fn stuck_for_ms(&self, now_unix_ms: u64) -> Option<u64> {
        let dispatched = self.last_dispatch_unix_ms();
        if dispatched == 0 || dispatched <= self.last_completion_unix_ms() {
            return None;
        }
        Some(now_unix_ms.saturating_sub(dispatched))
    }
}

#[cfg(test)]
mod tests {
    use super::TurnClock;

    #[test]
    fn unit_stuck_only_while_dispatch_is_newer_than_completion() {
        let clock = TurnClock::new();
        assert_eq!(clock.stuck_for_ms(5_000), None);
        clock.mark_dispatch(1_000);
        assert_eq!(clock.stuck_for_ms(5_000), Some(4_000));
        clock.mark_completion(2_000);
        assert_eq!(clock.stuck_for_ms(5_000), None);
        let shared = clock.clone();
        shared.mark_dispatch(3_000);
        assert_eq!(clock.stuck_for_ms(3_500), Some(500));
    }
}
