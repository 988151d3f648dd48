//! Bounded retry for idempotent backend calls

use crate::error::PipelineError;
use std::time::Duration;

/// Exponential backoff applied to transient backend failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Backoff before retry number `attempt` (1-based), doubling up to `max_backoff`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt, or `None` when `error` should be returned.
    ///
    /// `attempt` is the number of attempts made so far.
    pub fn next_delay(&self, attempt: u32, error: &PipelineError) -> Option<Duration> {
        if error.is_transient() && attempt < self.max_attempts {
            Some(self.backoff(attempt))
        } else {
            None
        }
    }
}
