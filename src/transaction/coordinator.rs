//! Transaction coordinator - orchestrates begin/execute/commit/rollback.
//!
//! The coordinator is the main entry point. It handles:
//! - Opening a fresh context per attempt
//! - Running steps strictly in order, raced against the attempt timeout
//! - Compensating a failed attempt and deciding whether to retry
//! - Committing, then dispatching post-commit hooks
//! - Force-rolling-back abandoned contexts

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::store::DocumentStore;
use crate::transaction::compensation::{CompensationPlanner, CompensationReport};
use crate::transaction::config::{CoordinatorConfig, ExecuteOptions};
use crate::transaction::context::{
    TransactionContext, TransactionId, TransactionMetadata, TransactionStatus,
};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::hooks::PostCommitHooks;
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::registry::TransactionRegistry;
use crate::transaction::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::transaction::scope::TxScope;
use crate::transaction::stats::{CoordinatorStats, TransactionStats};

/// Boxed future returned by a step.
pub type StepFuture<T> = BoxFuture<'static, TransactionResult<T>>;

/// One unit of work in a transaction.
///
/// A step may run once per attempt, so it must be callable repeatedly.
pub type TxStep<T> = Arc<dyn Fn(TxScope) -> StepFuture<T> + Send + Sync>;

/// Wrap an async closure as a [`TxStep`].
pub fn step<T, F, Fut>(f: F) -> TxStep<T>
where
    F: Fn(TxScope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransactionResult<T>> + Send + 'static,
{
    Arc::new(move |scope| Box::pin(f(scope)))
}

/// Everything `execute_transaction` has to say about a call.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome<T> {
    pub success: bool,
    /// Step results in order, on success.
    pub data: Option<Vec<T>>,
    pub error: Option<String>,
    /// Id of the last attempt's context.
    pub transaction_id: TransactionId,
    /// Steps that completed in the last attempt.
    pub operations_count: usize,
    /// Store mutations the last attempt logged.
    pub mutations_count: usize,
    pub duration: Duration,
    pub attempts: u32,
}

/// Builder for [`TransactionCoordinator`].
pub struct CoordinatorBuilder {
    store: Arc<dyn DocumentStore>,
    config: CoordinatorConfig,
    registry: TransactionRegistry,
    hooks: PostCommitHooks,
    sleeper: Arc<dyn Sleeper>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing registry, e.g. one shared with another coordinator.
    pub fn registry(mut self, registry: TransactionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn hooks(mut self, hooks: PostCommitHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> TransactionCoordinator {
        TransactionCoordinator {
            inner: Arc::new(CoordinatorInner {
                policy: RetryPolicy::from_config(&self.config),
                store: self.store,
                config: self.config,
                registry: self.registry,
                hooks: self.hooks,
                sleeper: self.sleeper,
                stats: TransactionStats::default(),
            }),
        }
    }
}

/// Application-level transaction coordinator.
///
/// This is compensation, not ACID: a failed attempt is undone by applying
/// the inverse of every logged mutation, newest first. There is no isolation
/// between concurrent transactions and nothing survives a process restart.
///
/// Thread-safe: can be shared across tasks via Clone (uses Arc internally).
#[derive(Clone)]
pub struct TransactionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    store: Arc<dyn DocumentStore>,
    config: CoordinatorConfig,
    registry: TransactionRegistry,
    hooks: PostCommitHooks,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    stats: TransactionStats,
}

impl TransactionCoordinator {
    /// Create a coordinator with default configuration and its own registry.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn builder(store: Arc<dyn DocumentStore>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            store,
            config: CoordinatorConfig::default(),
            registry: TransactionRegistry::new(),
            hooks: PostCommitHooks::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &TransactionRegistry {
        &self.inner.registry
    }

    /// Open and register a new active context.
    pub fn begin_transaction(
        &self,
        isolation_level: IsolationLevel,
        metadata: TransactionMetadata,
    ) -> TransactionId {
        let context = TransactionContext::new(isolation_level, metadata);
        let tx_id = self.inner.registry.insert(context);
        TransactionStats::incr(&self.inner.stats.started);
        debug!(tx_id = %tx_id, isolation = %isolation_level, "transaction started");
        tx_id
    }

    /// Store handle for a context opened with [`begin_transaction`](Self::begin_transaction).
    pub fn scope(&self, tx_id: &TransactionId) -> TransactionResult<TxScope> {
        self.inner.registry.ensure_open(tx_id)?;
        let metadata = self
            .inner
            .registry
            .get(tx_id)
            .map(|ctx| ctx.metadata)
            .unwrap_or_default();
        Ok(TxScope::new(
            tx_id.clone(),
            metadata,
            self.inner.registry.clone(),
            self.inner.store.clone(),
        ))
    }

    /// Commit an active context.
    ///
    /// Fails with [`TransactionError::NotActive`] if the context already
    /// reached a terminal state or is being closed by someone else.
    pub async fn commit_transaction(&self, tx_id: &TransactionId) -> TransactionResult<()> {
        self.commit_inner(tx_id).await.map(|_| ())
    }

    async fn commit_inner(&self, tx_id: &TransactionId) -> TransactionResult<TransactionContext> {
        let committed = self.inner.registry.claim_committed(tx_id)?;

        // Detached so a dropped caller cannot strand the claimed context.
        let this = self.clone();
        let context = committed.clone();
        let task = tokio::spawn(async move { this.settle_commit(context).await });
        if let Err(join_error) = task.await {
            error!(tx_id = %tx_id, error = %join_error, "commit finalization aborted");
            self.evict(tx_id);
        }
        Ok(committed)
    }

    async fn settle_commit(&self, committed: TransactionContext) {
        let tx_id = &committed.id;
        let report = self.inner.hooks.run(&committed).await;
        if report.failures > 0 {
            TransactionStats::add(&self.inner.stats.hook_failures, report.failures as u64);
            warn!(tx_id = %tx_id, failures = report.failures, "post-commit hooks partially failed");
        }

        if self.inner.registry.remove(tx_id).is_some() {
            self.record_terminal(TransactionStatus::Committed);
            debug!(tx_id = %tx_id, operations = committed.operations.len(), "transaction committed");
        }
    }

    /// Roll back an active context by compensating its operations.
    ///
    /// Idempotent: a missing or already-terminal id is a logged no-op and
    /// returns `None`. Otherwise returns the terminal status reached:
    /// `RolledBack` if every compensation succeeded, `Failed` if any errored.
    ///
    /// Once claimed, compensation runs to completion even if this future is
    /// dropped.
    pub async fn rollback_transaction(&self, tx_id: &TransactionId) -> Option<TransactionStatus> {
        let context = match self.inner.registry.claim(tx_id) {
            Ok(context) => context,
            Err(e) => {
                debug!(tx_id = %tx_id, reason = %e, "rollback skipped");
                return None;
            }
        };

        let plan = CompensationPlanner::plan(&context);
        if plan.is_empty() {
            return self.settle_rollback(tx_id, CompensationReport::default());
        }

        let this = self.clone();
        let id = tx_id.clone();
        let task = tokio::spawn(async move {
            let report = CompensationPlanner::execute(plan, this.inner.store.as_ref()).await;
            this.settle_rollback(&id, report)
        });
        match task.await {
            Ok(status) => status,
            Err(join_error) => {
                error!(tx_id = %tx_id, error = %join_error, "rollback task aborted");
                self.evict(tx_id)
            }
        }
    }

    fn settle_rollback(
        &self,
        tx_id: &TransactionId,
        report: CompensationReport,
    ) -> Option<TransactionStatus> {
        let status = if report.is_clean() {
            debug!(tx_id = %tx_id, compensated = report.succeeded, "transaction rolled back");
            TransactionStatus::RolledBack
        } else {
            TransactionStats::add(
                &self.inner.stats.compensation_failures,
                report.failures.len() as u64,
            );
            for failure in &report.failures {
                error!(tx_id = %tx_id, error = %failure, "compensation error");
            }
            error!(
                tx_id = %tx_id,
                failures = report.failures.len(),
                "rollback incomplete; state may be inconsistent"
            );
            TransactionStatus::Failed
        };

        match self.inner.registry.finish(tx_id, status) {
            Some(_) => {
                self.record_terminal(status);
                Some(status)
            }
            None => {
                // Evicted by a sweep while compensating.
                self.inner.registry.final_status(tx_id)
            }
        }
    }

    /// Drop a context whose close never finished, counting its terminal state.
    fn evict(&self, tx_id: &TransactionId) -> Option<TransactionStatus> {
        let evicted = self.inner.registry.evict(tx_id)?;
        self.record_terminal(evicted.status);
        Some(evicted.status)
    }

    fn record_terminal(&self, status: TransactionStatus) {
        let stats = &self.inner.stats;
        match status {
            TransactionStatus::Committed => TransactionStats::incr(&stats.committed),
            TransactionStatus::RolledBack => TransactionStats::incr(&stats.rolled_back),
            TransactionStatus::Failed => TransactionStats::incr(&stats.failed),
            TransactionStatus::Active => {}
        }
    }

    /// Snapshot of a registered context; `None` once it has been removed.
    pub fn get_transaction_status(&self, tx_id: &TransactionId) -> Option<TransactionContext> {
        self.inner.registry.get(tx_id)
    }

    pub fn get_active_transactions(&self) -> Vec<TransactionContext> {
        self.inner.registry.list_active()
    }

    /// Force-roll-back every unclaimed active context older than `max_age`
    /// and evict every context whose commit or rollback has been running for
    /// longer than `max_age`. Returns how many were reaped.
    pub async fn cleanup_stale_transactions(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let stale = self.inner.registry.stale(max_age, now);
        let stuck = self.inner.registry.stuck_closing(max_age, now);

        let mut reaped = 0;
        for tx_id in stale {
            if let Some(status) = self.rollback_transaction(&tx_id).await {
                warn!(tx_id = %tx_id, status = %status, "reaped stale transaction");
                reaped += 1;
            }
        }
        for tx_id in stuck {
            if let Some(status) = self.evict(&tx_id) {
                error!(tx_id = %tx_id, status = %status, "evicted transaction stuck while closing");
                reaped += 1;
            }
        }
        if reaped > 0 {
            TransactionStats::add(&self.inner.stats.reaped, reaped as u64);
            info!(reaped, "stale transaction sweep finished");
        }
        reaped
    }

    /// Counters plus current registry occupancy.
    pub fn stats(&self) -> CoordinatorStats {
        let oldest_age = self
            .inner
            .registry
            .oldest_start()
            .and_then(|start| (Utc::now() - start).to_std().ok());
        self.inner
            .stats
            .snapshot(self.inner.registry.len(), oldest_age)
    }

    /// Run `steps` as one transaction, retrying failed attempts.
    ///
    /// Never fails: every outcome, including panics inside steps, is
    /// reported through the returned [`ExecutionOutcome`].
    pub async fn execute_transaction<T>(
        &self,
        steps: Vec<TxStep<T>>,
        options: ExecuteOptions,
    ) -> ExecutionOutcome<T>
    where
        T: Send + 'static,
    {
        let started = Instant::now();
        let config = &self.inner.config;
        let max_retries = options.max_retries.unwrap_or(config.max_retries).max(1);
        let timeout = options.timeout.unwrap_or(config.timeout);
        let isolation = options.isolation_level.unwrap_or(config.default_isolation);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let metadata = options.metadata.for_attempt(attempt);
            let tx_id = self.begin_transaction(isolation, metadata.clone());
            let completed = Arc::new(AtomicUsize::new(0));

            let result = match self
                .run_attempt(&tx_id, metadata, &steps, timeout, completed.clone())
                .await
            {
                Ok(data) => self.commit_inner(&tx_id).await.map(|ctx| (data, ctx)),
                Err(e) => Err(e),
            };

            let err = match result {
                Ok((data, committed)) => {
                    return ExecutionOutcome {
                        success: true,
                        operations_count: data.len(),
                        data: Some(data),
                        error: None,
                        transaction_id: tx_id,
                        mutations_count: committed.operations.len(),
                        duration: started.elapsed(),
                        attempts: attempt,
                    };
                }
                Err(e) => e,
            };

            if matches!(err, TransactionError::Timeout { .. }) {
                TransactionStats::incr(&self.inner.stats.timeouts);
            }
            let operations_count = completed.load(Ordering::SeqCst);
            let mutations_count = self
                .inner
                .registry
                .get(&tx_id)
                .map_or(0, |ctx| ctx.operations.len());
            self.rollback_transaction(&tx_id).await;

            if self.inner.policy.should_retry(attempt, &err, max_retries) {
                let delay = self.inner.policy.delay_for_attempt(attempt);
                TransactionStats::incr(&self.inner.stats.retries);
                warn!(
                    tx_id = %tx_id,
                    attempt,
                    max_retries,
                    class = %err.class(),
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "transaction attempt failed; retrying"
                );
                self.inner.sleeper.sleep(delay).await;
                continue;
            }

            warn!(
                tx_id = %tx_id,
                attempt,
                class = %err.class(),
                error = %err,
                "transaction failed"
            );
            return ExecutionOutcome {
                success: false,
                data: None,
                error: Some(err.to_string()),
                transaction_id: tx_id,
                operations_count,
                mutations_count,
                duration: started.elapsed(),
                attempts: attempt,
            };
        }
    }

    /// Run all steps of one attempt in order on a detached task, raced
    /// against `timeout`.
    ///
    /// A timeout stops the coordinator from waiting but does not abort the
    /// task; the task notices the closed context before its next step, and a
    /// mutation already in flight is compensated by the scope when it lands.
    async fn run_attempt<T>(
        &self,
        tx_id: &TransactionId,
        metadata: TransactionMetadata,
        steps: &[TxStep<T>],
        timeout: Duration,
        completed: Arc<AtomicUsize>,
    ) -> TransactionResult<Vec<T>>
    where
        T: Send + 'static,
    {
        let scope = TxScope::new(
            tx_id.clone(),
            metadata,
            self.inner.registry.clone(),
            self.inner.store.clone(),
        );
        let steps = steps.to_vec();

        let task = tokio::spawn(async move {
            let mut results = Vec::with_capacity(steps.len());
            for step in &steps {
                scope.ensure_open()?;
                results.push(step(scope.clone()).await?);
                completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<_, TransactionError>(results)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(TransactionError::Aborted(join_error.to_string())),
            Err(_) => Err(TransactionError::Timeout {
                tx_id: tx_id.to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("active_count", &self.inner.registry.len())
            .finish()
    }
}
