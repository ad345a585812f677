//! Transaction coordination for txsaga.
//!
//! This module simulates multi-step transactions over a store that offers no
//! native ones, using compensating actions (the saga pattern). Each attempt
//! gets its own context (`tx_{ulid}`) where operations and rollback snapshots
//! accumulate. On commit, post-commit hooks fire and the context is dropped;
//! on failure, every logged operation is undone newest first.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  TransactionCoordinator                     │
//! │   (begin / execute / commit / rollback, owns the registry)  │
//! └─────────────────────────────────────────────────────────────┘
//!        │              │               │               │
//!        ▼              ▼               ▼               ▼
//!  ┌───────────┐ ┌──────────────┐ ┌────────────┐ ┌─────────────┐
//!  │RetryPolicy│ │ Compensation │ │PostCommit  │ │   Stale     │
//!  │ (backoff) │ │   Planner    │ │   Hooks    │ │   Reaper    │
//!  └───────────┘ └──────────────┘ └────────────┘ └─────────────┘
//! ```
//!
//! Guarantees are deliberately weak: no isolation between concurrent
//! transactions, no durability across restarts, and post-commit side effects
//! are best-effort. A rollback whose compensations all succeeded ends
//! `rolled_back`; one where any compensation errored ends `failed` and the
//! affected records need inspection.
//!
//! # Usage
//!
//! ```ignore
//! use txsaga::transaction::{step, ExecuteOptions, TransactionCoordinator, TxScope};
//!
//! let coordinator = TransactionCoordinator::new(Arc::new(store));
//!
//! let outcome = coordinator
//!     .execute_transaction(
//!         vec![
//!             step(|tx: TxScope| async move { tx.insert("deposits", deposit).await }),
//!             step(|tx: TxScope| async move { tx.update("wallets", "w1", patch).await }),
//!         ],
//!         ExecuteOptions::new().max_retries(3),
//!     )
//!     .await;
//!
//! if !outcome.success {
//!     eprintln!("transaction failed: {:?}", outcome.error);
//! }
//! ```

mod compensation;
mod config;
mod context;
mod coordinator;
mod error;
mod hooks;
mod isolation;
mod reaper;
mod registry;
mod retry;
mod scope;
mod stats;

pub use compensation::{
    CompensatingAction, CompensationError, CompensationPlan, CompensationPlanner,
    CompensationReport,
};
pub use config::{CoordinatorConfig, ExecuteOptions};
pub use context::{
    Operation, OperationKind, TransactionContext, TransactionId, TransactionMetadata,
    TransactionStatus,
};
pub use coordinator::{
    step, CoordinatorBuilder, ExecutionOutcome, StepFuture, TransactionCoordinator, TxStep,
};
pub use error::{classify_message, ErrorClass, TransactionError, TransactionResult};
pub use hooks::{
    AuditEntry, AuditSink, CacheInvalidator, HookError, HookReport, NoopHooks, PostCommitHooks,
    SearchIndexer,
};
pub use isolation::IsolationLevel;
pub use reaper::{ReaperHandle, StaleTransactionReaper};
pub use registry::TransactionRegistry;
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};
pub use scope::TxScope;
pub use stats::CoordinatorStats;
