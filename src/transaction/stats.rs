//! Coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Monotonic counters updated by the coordinator and the reaper.
#[derive(Debug, Default)]
pub struct TransactionStats {
    pub(crate) started: AtomicU64,
    pub(crate) committed: AtomicU64,
    pub(crate) rolled_back: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) timeouts: AtomicU64,
    pub(crate) reaped: AtomicU64,
    pub(crate) compensation_failures: AtomicU64,
    pub(crate) hook_failures: AtomicU64,
}

impl TransactionStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, active: usize, oldest_active_age: Option<Duration>) -> CoordinatorStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CoordinatorStats {
            started: load(&self.started),
            committed: load(&self.committed),
            rolled_back: load(&self.rolled_back),
            failed: load(&self.failed),
            retries: load(&self.retries),
            timeouts: load(&self.timeouts),
            reaped: load(&self.reaped),
            compensation_failures: load(&self.compensation_failures),
            hook_failures: load(&self.hook_failures),
            active,
            oldest_active_age,
        }
    }
}

/// Point-in-time view of coordinator activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Contexts ever opened (one per attempt).
    pub started: u64,
    pub committed: u64,
    pub rolled_back: u64,
    /// Rollbacks where a compensation errored, plus contexts evicted while
    /// still closing.
    pub failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    /// Contexts force-rolled-back or evicted by a sweep.
    pub reaped: u64,
    pub compensation_failures: u64,
    pub hook_failures: u64,
    /// Contexts currently in the registry.
    pub active: usize,
    pub oldest_active_age: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = TransactionStats::default();
        TransactionStats::incr(&stats.started);
        TransactionStats::incr(&stats.started);
        TransactionStats::add(&stats.hook_failures, 3);

        let snap = stats.snapshot(1, Some(Duration::from_secs(2)));
        assert_eq!(snap.started, 2);
        assert_eq!(snap.hook_failures, 3);
        assert_eq!(snap.committed, 0);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.oldest_active_age, Some(Duration::from_secs(2)));
    }
}
