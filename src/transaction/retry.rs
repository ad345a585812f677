//! Retry policy and the wait primitive used between attempts.
//!
//! The policy is pure: it decides, it never sleeps. Sleeping goes through
//! [`Sleeper`] so tests can observe requested delays without timers.

use std::time::Duration;

use async_trait::async_trait;

use crate::transaction::config::CoordinatorConfig;
use crate::transaction::error::TransactionError;

/// Exponential backoff with a cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(5000))
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self::new(config.retry_base_delay, config.retry_max_delay)
    }

    /// Whether attempt number `attempt` (1-based) that failed with `error`
    /// should be followed by another one.
    pub fn should_retry(&self, attempt: u32, error: &TransactionError, max_retries: u32) -> bool {
        attempt < max_retries.max(1) && error.is_retryable()
    }

    /// Delay before the attempt following `attempt`:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Something that can wait.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Waits on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), ms(1000));
        assert_eq!(policy.delay_for_attempt(2), ms(2000));
        assert_eq!(policy.delay_for_attempt(3), ms(4000));
        assert_eq!(policy.delay_for_attempt(4), ms(5000));
        assert_eq!(policy.delay_for_attempt(40), ms(5000));
        assert_eq!(policy.delay_for_attempt(0), ms(1000));
    }

    #[test]
    fn test_retry_bounded_by_max_retries() {
        let policy = RetryPolicy::default();
        let transient = TransactionError::from(StoreError::Unavailable("reset".into()));
        assert!(policy.should_retry(1, &transient, 3));
        assert!(policy.should_retry(2, &transient, 3));
        assert!(!policy.should_retry(3, &transient, 3));
        assert!(!policy.should_retry(1, &transient, 0));
    }

    #[test]
    fn test_non_retryable_stops_immediately() {
        let policy = RetryPolicy::default();
        let dup = TransactionError::step("duplicate key value violates unique constraint");
        assert!(!policy.should_retry(1, &dup, 10));

        let timeout = TransactionError::Timeout {
            tx_id: "tx_1".into(),
            elapsed_ms: 10,
        };
        assert!(policy.should_retry(1, &timeout, 2));
    }

    #[test]
    fn test_custom_delays() {
        let policy = RetryPolicy::new(ms(10), ms(25));
        assert_eq!(policy.delay_for_attempt(1), ms(10));
        assert_eq!(policy.delay_for_attempt(2), ms(20));
        assert_eq!(policy.delay_for_attempt(3), ms(25));
    }
}
