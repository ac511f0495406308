//! Jittered exponential backoff with no retry limit.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for watch error recovery.
///
/// Delays grow exponentially from the initial value up to a cap and stay
/// there; there is no bound on the number of retries. Each delay carries
/// random jitter of up to half its base so recovering watchers do not
/// synchronize against a struggling store.
#[derive(Debug)]
pub(crate) struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    pub(crate) fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The next delay to wait; advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let base_ms = self.current.as_millis() as u64;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = rand::rng().random_range(0..base_ms / 2 + 1);
        Duration::from_millis(base_ms + jitter_ms)
    }

    /// Return the schedule to its initial delay.
    pub(crate) fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(60))
    }
}
