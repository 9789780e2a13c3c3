//! Reconnect backoff policy

use std::time::Duration;

/// Linear, capped backoff for transient connection failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Added per further consecutive failure
    pub step: Duration,
    pub max: Duration,
    /// Consecutive failures tolerated before the session is abandoned
    pub max_failures: u32,
    /// Delay for closures that are neither logouts nor connection failures
    pub restart_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(3000),
            step: Duration::from_millis(2000),
            max: Duration::from_millis(10_000),
            max_failures: 5,
            restart_delay: Duration::from_millis(2000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the reconnect following the `failures`-th consecutive
    /// failure, or `None` once the session should be abandoned.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if failures > self.max_failures {
            return None;
        }
        let extra = self.step * failures.saturating_sub(1);
        Some((self.base + extra).min(self.max))
    }
}
