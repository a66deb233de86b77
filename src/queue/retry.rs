//! Task-level retry policy
//!
//! A task whose worker fails with a transient error consumes one retry. While
//! retries remain it re-enters the queue after an exponential backoff
//! (`base * 2^(n-1)` for the n-th retry, capped). Non-transient failures, and
//! tasks that have used every retry, stay FAILED until the user retries them.

use crate::utils::config::QueueSettings;
use crate::utils::error::QueueError;
use std::time::Duration;

/// Outcome of a task-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue automatically after `delay`; `retry_count` is the new count
    RetryAfter { delay: Duration, retry_count: u32 },
    /// Leave FAILED; retries were consumed up to `retry_count`
    GiveUp { retry_count: u32 },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.retry_base_delay(),
            max_delay: settings.retry_max_delay(),
        }
    }

    /// Decide what happens to a task that failed with `error` after having
    /// already consumed `retry_count` retries.
    pub fn decide(&self, error: &QueueError, retry_count: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { retry_count };
        }

        let consumed = retry_count.saturating_add(1).min(self.max_retries);
        if retry_count >= self.max_retries || consumed >= self.max_retries {
            return RetryDecision::GiveUp {
                retry_count: consumed.max(retry_count),
            };
        }

        RetryDecision::RetryAfter {
            delay: self.backoff(consumed),
            retry_count: consumed,
        }
    }

    /// Delay before the `attempt`-th automatic retry (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        }
    }

    fn network() -> QueueError {
        QueueError::Network("connection reset".into())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(64), Duration::from_millis(1_000));
    }

    #[test]
    fn test_transient_failures_consume_retries() {
        let policy = policy();
        assert_eq!(
            policy.decide(&network(), 0),
            RetryDecision::RetryAfter {
                delay: Duration::from_millis(100),
                retry_count: 1
            }
        );
        assert_eq!(
            policy.decide(&network(), 1),
            RetryDecision::RetryAfter {
                delay: Duration::from_millis(200),
                retry_count: 2
            }
        );
        // Third failed attempt exhausts the budget
        assert_eq!(
            policy.decide(&network(), 2),
            RetryDecision::GiveUp { retry_count: 3 }
        );
        assert_eq!(
            policy.decide(&network(), 3),
            RetryDecision::GiveUp { retry_count: 3 }
        );
    }

    #[test]
    fn test_non_transient_failures_keep_retry_count() {
        let policy = policy();
        for error in [
            QueueError::NotFound("gone".into()),
            QueueError::Validation("unsupported format".into()),
            QueueError::DiskFull("full".into()),
        ] {
            assert_eq!(
                policy.decide(&error, 1),
                RetryDecision::GiveUp { retry_count: 1 }
            );
        }
    }

    #[test]
    fn test_zero_retries_never_requeues() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..policy()
        };
        assert_eq!(
            policy.decide(&network(), 0),
            RetryDecision::GiveUp { retry_count: 0 }
        );
    }
}
