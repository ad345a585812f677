//! Compensation planning and execution.
//!
//! Every mutation kind has a statically known inverse:
//!
//! | operation | compensation                 |
//! |-----------|------------------------------|
//! | insert    | delete the inserted record   |
//! | update    | restore the captured snapshot |
//! | delete    | restore the deleted record   |
//!
//! The plan walks the operation log newest first, since later operations may
//! depend on earlier ones still being present. Execution is continue-on-error:
//! every action is attempted and all failures are collected.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::store::{DocumentStore, StoreError};
use crate::transaction::context::{Operation, OperationKind, TransactionContext};
use crate::transaction::error::panic_message;

/// A single compensating action that could not be planned or applied.
#[derive(Debug, Error)]
pub enum CompensationError {
    #[error("no rollback snapshot for {kind} operation {operation_id}")]
    MissingSnapshot {
        operation_id: String,
        kind: OperationKind,
    },

    #[error("compensation for operation {operation_id} failed: {source}")]
    Store {
        operation_id: String,
        #[source]
        source: StoreError,
    },

    #[error("compensation for operation {operation_id} panicked: {message}")]
    Panicked {
        operation_id: String,
        message: String,
    },
}

/// The inverse of one logged operation.
#[derive(Debug, Clone, PartialEq)]
pub enum CompensatingAction {
    /// Undo an insert.
    Delete {
        operation_id: String,
        collection: String,
        record_id: String,
    },
    /// Undo an update or delete by putting the prior record back.
    Restore {
        operation_id: String,
        collection: String,
        record: Value,
    },
}

impl CompensatingAction {
    /// Build the inverse of `operation` given its captured snapshot.
    pub fn for_operation(
        operation: &Operation,
        snapshot: Option<&Value>,
    ) -> Result<Self, CompensationError> {
        let missing = || CompensationError::MissingSnapshot {
            operation_id: operation.id.clone(),
            kind: operation.kind,
        };
        match operation.kind {
            OperationKind::Insert => Ok(CompensatingAction::Delete {
                operation_id: operation.id.clone(),
                collection: operation.collection.clone(),
                record_id: operation.record_id.clone(),
            }),
            OperationKind::Update => Ok(CompensatingAction::Restore {
                operation_id: operation.id.clone(),
                collection: operation.collection.clone(),
                record: snapshot.cloned().ok_or_else(missing)?,
            }),
            OperationKind::Delete => Ok(CompensatingAction::Restore {
                operation_id: operation.id.clone(),
                collection: operation.collection.clone(),
                record: snapshot
                    .or(Some(&operation.data).filter(|d| d.is_object()))
                    .cloned()
                    .ok_or_else(missing)?,
            }),
        }
    }

    pub fn operation_id(&self) -> &str {
        match self {
            CompensatingAction::Delete { operation_id, .. }
            | CompensatingAction::Restore { operation_id, .. } => operation_id,
        }
    }

    /// Apply the action. Both inverses are idempotent against the store, so a
    /// mutation that lands late and gets compensated twice is harmless.
    pub async fn apply(&self, store: &dyn DocumentStore) -> Result<(), CompensationError> {
        let result = match self {
            CompensatingAction::Delete {
                collection,
                record_id,
                ..
            } => store.delete(collection, record_id).await.map(|_| ()),
            CompensatingAction::Restore {
                collection, record, ..
            } => store.restore(collection, record.clone()).await,
        };
        result.map_err(|source| CompensationError::Store {
            operation_id: self.operation_id().to_string(),
            source,
        })
    }
}

/// Ordered compensations for one context, newest operation first.
#[derive(Debug, Default)]
pub struct CompensationPlan {
    pub actions: Vec<CompensatingAction>,
    /// Operations whose inverse could not be built.
    pub unplannable: Vec<CompensationError>,
}

impl CompensationPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.unplannable.is_empty()
    }
}

/// Outcome of running a plan.
#[derive(Debug, Default)]
pub struct CompensationReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<CompensationError>,
}

impl CompensationReport {
    /// True when the prior state is confirmed restored.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builds and runs compensation plans.
pub struct CompensationPlanner;

impl CompensationPlanner {
    /// Plan the compensations for a context's operation log.
    pub fn plan(context: &TransactionContext) -> CompensationPlan {
        Self::plan_operations(&context.operations, &context.rollback_snapshots)
    }

    pub fn plan_operations(
        operations: &[Operation],
        snapshots: &HashMap<String, Value>,
    ) -> CompensationPlan {
        let mut plan = CompensationPlan::default();
        for operation in operations.iter().rev() {
            match CompensatingAction::for_operation(operation, snapshots.get(&operation.id)) {
                Ok(action) => plan.actions.push(action),
                Err(e) => plan.unplannable.push(e),
            }
        }
        plan
    }

    /// Run every action in order, continuing past failures.
    pub async fn execute(plan: CompensationPlan, store: &dyn DocumentStore) -> CompensationReport {
        let mut report = CompensationReport {
            failures: plan.unplannable,
            ..Default::default()
        };

        for action in &plan.actions {
            report.attempted += 1;
            let applied = match AssertUnwindSafe(action.apply(store)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(CompensationError::Panicked {
                    operation_id: action.operation_id().to_string(),
                    message: panic_message(&*payload),
                }),
            };
            match applied {
                Ok(()) => {
                    report.succeeded += 1;
                    debug!(operation_id = action.operation_id(), "compensation applied");
                }
                Err(e) => {
                    warn!(operation_id = action.operation_id(), error = %e, "compensation failed");
                    report.failures.push(e);
                }
            }
        }
        report
    }
}
