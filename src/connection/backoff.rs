use std::time::Duration;

use crate::config::ReconnectConfig;

/// Bounded linear reconnect schedule.
///
/// The Nth retry (1-indexed) waits `N * base`. Once `max_attempts`
/// retries have been scheduled without a successful open in between,
/// no further retry is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(1000),
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            base: cfg.base_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Given the number of retries already scheduled since the last
    /// successful open, returns the next attempt number and its delay,
    /// or `None` when the budget is spent.
    pub fn next(&self, attempts_so_far: u32) -> Option<(u32, Duration)> {
        if attempts_so_far >= self.max_attempts {
            return None;
        }

        let attempt = attempts_so_far + 1;
        Some((attempt, self.base.saturating_mul(attempt)))
    }
}
