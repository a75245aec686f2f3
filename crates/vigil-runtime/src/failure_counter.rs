use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Consecutive prompt failures; any successful turn resets it.
#[derive(Debug, Clone, Default)]
pub struct FailureCounter {
    count: Arc<AtomicU32>,
}

impl FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure and returns the new consecutive count.
    pub fn record_failure(&self) -> u32 {
        let previous = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_add(1))
            })
            .unwrap_or_default();
        previous.saturating_add(1)
    }

    pub fn record_success(&self) {
        self.count.store(0, Ordering::SeqCst);
    }

    pub fn current(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}
