use std::time::Duration;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_FACTOR: u32 = 2;

/// Exponential reconnect delay: `base * factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: DEFAULT_FACTOR,
        }
    }

    /// Delay before retry number `attempt` (0 = first retry after a failure).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let max = self.max.max(self.base);
        let mut delay = self.base;
        for _ in 0..attempt {
            delay = delay.saturating_mul(self.factor.max(1));
            if delay >= max {
                return max;
            }
        }
        delay.min(max)
    }
}
