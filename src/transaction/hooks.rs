//! Post-commit side effects.
//!
//! After a context commits, affected records are pushed to three external
//! collaborators: the cache (invalidation), the search index (resync) and the
//! audit log. All of this is best-effort. A failure is logged and counted but
//! can never undo or fail the commit; the atomicity guarantee covers the
//! primary mutations only.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::transaction::context::{Operation, OperationKind, TransactionContext, TransactionId};
use crate::transaction::error::panic_message;

/// Failure reported by a collaborator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Cache-invalidation service.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, pattern: &str) -> Result<(), HookError>;
}

/// Search-index synchronization service.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn handle_change(
        &self,
        kind: OperationKind,
        collection: &str,
        record: &Value,
    ) -> Result<(), HookError>;
}

/// Audit-log sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), HookError>;
}

/// One audit-log line per committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub transaction_id: TransactionId,
    pub operation_id: String,
    pub actor: Option<String>,
    pub action: OperationKind,
    pub collection: String,
    pub record_id: String,
    pub timestamp: DateTime<Utc>,
    pub description: Option<String>,
}

/// Collaborator that accepts everything and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

#[async_trait]
impl CacheInvalidator for NoopHooks {
    async fn invalidate(&self, _pattern: &str) -> Result<(), HookError> {
        Ok(())
    }
}

#[async_trait]
impl SearchIndexer for NoopHooks {
    async fn handle_change(
        &self,
        _kind: OperationKind,
        _collection: &str,
        _record: &Value,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

#[async_trait]
impl AuditSink for NoopHooks {
    async fn append(&self, _entry: AuditEntry) -> Result<(), HookError> {
        Ok(())
    }
}

/// What a post-commit run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookReport {
    pub invalidations: usize,
    pub index_updates: usize,
    pub audit_entries: usize,
    pub failures: usize,
}

/// Dispatches post-commit side effects to the configured collaborators.
#[derive(Clone)]
pub struct PostCommitHooks {
    cache: Arc<dyn CacheInvalidator>,
    search: Arc<dyn SearchIndexer>,
    audit: Arc<dyn AuditSink>,
}

impl Default for PostCommitHooks {
    fn default() -> Self {
        Self {
            cache: Arc::new(NoopHooks),
            search: Arc::new(NoopHooks),
            audit: Arc::new(NoopHooks),
        }
    }
}

impl PostCommitHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(mut self, cache: Arc<dyn CacheInvalidator>) -> Self {
        self.cache = cache;
        self
    }

    pub fn search(mut self, search: Arc<dyn SearchIndexer>) -> Self {
        self.search = search;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Run all side effects for a committed context.
    pub async fn run(&self, context: &TransactionContext) -> HookReport {
        let mut report = HookReport::default();
        let tx_id = context.id.as_str();
        let latest = latest_per_record(&context.operations);

        let collections: BTreeSet<&str> = latest.keys().map(|(c, _)| *c).collect();
        let patterns = collections
            .iter()
            .map(|c| format!("{c}:*"))
            .chain(latest.keys().map(|(c, id)| format!("{c}:{id}")));
        for pattern in patterns {
            match guarded(self.cache.invalidate(&pattern)).await {
                Ok(()) => report.invalidations += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!(tx_id, pattern = %pattern, error = %e, "cache invalidation failed");
                }
            }
        }

        for op in latest.values() {
            match guarded(self.search.handle_change(op.kind, &op.collection, &op.data)).await {
                Ok(()) => report.index_updates += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!(
                        tx_id,
                        collection = %op.collection,
                        record_id = %op.record_id,
                        error = %e,
                        "search sync failed"
                    );
                }
            }
        }

        for op in &context.operations {
            let entry = AuditEntry {
                transaction_id: context.id.clone(),
                operation_id: op.id.clone(),
                actor: context.metadata.actor.clone(),
                action: op.kind,
                collection: op.collection.clone(),
                record_id: op.record_id.clone(),
                timestamp: op.timestamp,
                description: context.metadata.description.clone(),
            };
            match guarded(self.audit.append(entry)).await {
                Ok(()) => report.audit_entries += 1,
                Err(e) => {
                    report.failures += 1;
                    warn!(tx_id, operation_id = %op.id, error = %e, "audit append failed");
                }
            }
        }

        report
    }
}

/// A panicking collaborator counts as a failed one.
async fn guarded<F>(call: F) -> Result<(), HookError>
where
    F: Future<Output = Result<(), HookError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HookError::new(format!(
            "collaborator panicked: {}",
            panic_message(&*payload)
        ))),
    }
}

/// Affected `(collection, id)` pairs with the last operation that touched each.
fn latest_per_record(operations: &[Operation]) -> BTreeMap<(&str, &str), &Operation> {
    operations
        .iter()
        .map(|op| ((op.collection.as_str(), op.record_id.as_str()), op))
        .collect()
}

impl std::fmt::Debug for PostCommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostCommitHooks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::testing::RecordingHooks;
    use crate::transaction::context::TransactionMetadata;
    use crate::transaction::isolation::IsolationLevel;

    fn committed_context() -> TransactionContext {
        let mut ctx = TransactionContext::new(
            IsolationLevel::default(),
            TransactionMetadata::new().actor("user-7"),
        );
        ctx.push(
            Operation::new(OperationKind::Insert, "deposits", "d1", json!({"id": "d1", "price": 1})),
            None,
        );
        ctx.push(
            Operation::new(OperationKind::Update, "deposits", "d1", json!({"id": "d1", "price": 2})),
            Some(json!({"id": "d1", "price": 1})),
        );
        ctx.push(
            Operation::new(OperationKind::Insert, "audit_log", "a1", json!({"id": "a1"})),
            None,
        );
        ctx
    }

    fn hooks_with(recorder: &Arc<RecordingHooks>) -> PostCommitHooks {
        PostCommitHooks::new()
            .cache(recorder.clone())
            .search(recorder.clone())
            .audit(recorder.clone())
    }

    #[tokio::test]
    async fn test_dispatches_all_side_effects() {
        let recorder = Arc::new(RecordingHooks::default());
        let report = hooks_with(&recorder).run(&committed_context()).await;

        assert_eq!(
            *recorder.invalidated.lock(),
            vec!["audit_log:*", "deposits:*", "audit_log:a1", "deposits:d1"]
        );

        let indexed = recorder.indexed.lock();
        assert_eq!(indexed.len(), 2);
        let deposit = indexed.iter().find(|(_, c, _)| c == "deposits").unwrap();
        assert_eq!(deposit.0, OperationKind::Update);
        assert_eq!(deposit.2["price"], 2);

        let audited = recorder.audited.lock();
        assert_eq!(audited.len(), 3);
        assert!(audited.iter().all(|e| e.actor.as_deref() == Some("user-7")));

        assert_eq!(
            report,
            HookReport {
                invalidations: 4,
                index_updates: 2,
                audit_entries: 3,
                failures: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_fatal() {
        let recorder = Arc::new(RecordingHooks::failing());
        let report = hooks_with(&recorder).run(&committed_context()).await;
        assert_eq!(report.failures, 4 + 2 + 3);
        assert_eq!(recorder.audited.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_panicking_collaborator_counts_as_failure() {
        let recorder = Arc::new(RecordingHooks::panicking());
        let report = hooks_with(&recorder).run(&committed_context()).await;
        assert_eq!(report.failures, 4 + 2 + 3);
        assert_eq!(report.audit_entries, 0);
        assert_eq!(recorder.audited.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_noop_by_default() {
        let report = PostCommitHooks::new().run(&committed_context()).await;
        assert_eq!(report.failures, 0);
        assert_eq!(report.audit_entries, 3);
    }
}
