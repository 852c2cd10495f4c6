//! Retry decisions for failed attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;
use crate::error::ErrorClass;

/// What to do with a task after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`, runnable again after `delay`. Consumes an attempt.
    Retry { delay: Duration },
    /// Back to `Pending` without consuming an attempt; the owner's session
    /// must be restored first.
    Hold,
    /// Give up: `Failed`.
    Fail,
    /// Nothing to record (cancelled, or another worker owns the task).
    Discard,
}

/// Exponential backoff with jitter, bounded by an attempt budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
        }
    }

    /// Decide for a task that has already failed `attempt_count` times and
    /// just failed again with `class`.
    pub fn decide(
        &self,
        class: ErrorClass,
        attempt_count: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        match class {
            ErrorClass::Cancelled | ErrorClass::StoreConflict => RetryDecision::Discard,
            ErrorClass::SessionExpired => RetryDecision::Hold,
            ErrorClass::PermissionDenied | ErrorClass::NotFound | ErrorClass::Filtered => {
                RetryDecision::Fail
            }
            ErrorClass::Transient | ErrorClass::Internal => {
                if attempt_count + 1 >= self.max_attempts {
                    RetryDecision::Fail
                } else {
                    let delay = self.jittered(attempt_count);
                    RetryDecision::Retry {
                        delay: retry_after.map_or(delay, |server| server.max(delay)),
                    }
                }
            }
        }
    }

    /// `base * 2^attempt`, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// Base delay plus up to 10% random jitter, still capped.
    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        base.mul_f64(1.0 + jitter).min(self.backoff_max)
    }
}
