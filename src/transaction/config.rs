//! Coordinator configuration and per-call execution options.

use std::time::Duration;

use crate::transaction::context::TransactionMetadata;
use crate::transaction::isolation::IsolationLevel;

/// Coordinator configuration options.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorConfig {
    /// Attempts per `execute_transaction` call (including the first).
    pub max_retries: u32,
    /// Time budget of a single attempt.
    pub timeout: Duration,
    /// Backoff after the first failed attempt; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Upper bound on the backoff.
    pub retry_max_delay: Duration,
    /// Age after which an active context counts as abandoned.
    pub stale_after: Duration,
    /// How often the background reaper sweeps.
    pub reap_interval: Duration,
    /// Isolation level recorded when the caller gives none.
    pub default_isolation: IsolationLevel,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_millis(30_000),
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(5000),
            stale_after: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60),
            default_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn stale_after(mut self, max_age: Duration) -> Self {
        self.stale_after = max_age;
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn default_isolation(mut self, level: IsolationLevel) -> Self {
        self.default_isolation = level;
        self
    }
}

/// Per-call overrides for `execute_transaction`.
///
/// Unset fields fall back to the coordinator's [`CoordinatorConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub metadata: TransactionMetadata,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn metadata(mut self, metadata: TransactionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.retry_max_delay, Duration::from_secs(5));
        assert_eq!(config.stale_after, Duration::from_secs(300));
        assert_eq!(config.reap_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_builders() {
        let config = CoordinatorConfig::new()
            .max_retries(5)
            .timeout(Duration::from_millis(250))
            .default_isolation(IsolationLevel::Serializable);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.default_isolation, IsolationLevel::Serializable);

        let options = ExecuteOptions::new()
            .max_retries(1)
            .metadata(TransactionMetadata::new().actor("ana"));
        assert_eq!(options.max_retries, Some(1));
        assert!(options.timeout.is_none());
        assert_eq!(options.metadata.actor.as_deref(), Some("ana"));
    }
}
