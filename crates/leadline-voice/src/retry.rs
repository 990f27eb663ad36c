//! Reconnect back-off.

use std::time::Duration;

/// Linear back-off with a hard cap on automatic retries.
///
/// `delay(n) = base * (n + 1)`. With the default policy the three failures of a
/// doomed call are followed by 2s, 4s and 6s waits; the call gives up when the last
/// wait ends, so it never makes more than `max_retries` connect attempts in a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy.
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    /// Delay before the retry that follows `retry_count` earlier retries,
    /// or `None` once the budget is spent.
    pub fn next_delay(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }
        Some(self.base_delay.saturating_mul(retry_count.saturating_add(1)))
    }

    /// Whether `retry_count` consecutive failures use up the budget.
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}
