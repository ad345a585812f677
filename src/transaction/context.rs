//! Transaction context: the per-attempt operation log.
//!
//! A context is created for every attempt, accumulates one [`Operation`] per
//! mutation performed through its scope, and holds the pre-mutation
//! snapshots needed to undo updates and deletes.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::transaction::isolation::IsolationLevel;

/// Unique, never reused transaction identifier (`tx_<ulid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(format!("tx_{}", Ulid::new().to_string().to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a context. Terminal once it leaves `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    /// Every compensation succeeded; state is confirmed restored.
    RolledBack,
    /// At least one compensation errored; state may be inconsistent and
    /// needs inspection.
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Kind of mutation an operation performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique operation id (`op_<ulid>`).
    pub id: String,
    pub kind: OperationKind,
    pub collection: String,
    /// Primary key of the affected record.
    pub record_id: String,
    /// The inserted or updated record, or the deleted one.
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        kind: OperationKind,
        collection: impl Into<String>,
        record_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: format!("op_{}", Ulid::new().to_string().to_lowercase()),
            kind,
            collection: collection.into(),
            record_id: record_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Caller-supplied context carried through a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// Who initiated the transaction; tagged onto audit entries.
    pub actor: Option<String>,
    pub description: Option<String>,
    /// 1-based attempt number within an `execute_transaction` call.
    pub attempt: u32,
}

impl TransactionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }
}

/// State of one transaction attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    pub id: TransactionId,
    /// Append-only while active.
    pub operations: Vec<Operation>,
    /// Pre-mutation state keyed by operation id (updates and deletes only).
    pub rollback_snapshots: HashMap<String, Value>,
    pub isolation_level: IsolationLevel,
    pub status: TransactionStatus,
    pub start_time: DateTime<Utc>,
    pub metadata: TransactionMetadata,
    /// When commit or rollback claimed the context; no further operations
    /// are accepted after that.
    #[serde(skip)]
    pub(crate) closing_since: Option<DateTime<Utc>>,
}

impl TransactionContext {
    /// Create a new active context with a fresh id.
    pub fn new(isolation_level: IsolationLevel, metadata: TransactionMetadata) -> Self {
        Self {
            id: TransactionId::generate(),
            operations: Vec::new(),
            rollback_snapshots: HashMap::new(),
            isolation_level,
            status: TransactionStatus::Active,
            start_time: Utc::now(),
            metadata,
            closing_since: None,
        }
    }

    /// Whether new operations may still be appended.
    pub fn accepts_operations(&self) -> bool {
        !self.status.is_terminal() && self.closing_since.is_none()
    }

    /// Time elapsed since the context was created.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.start_time
    }

    /// Append an operation, storing its snapshot if it has one.
    pub(crate) fn push(&mut self, operation: Operation, snapshot: Option<Value>) {
        if let Some(snapshot) = snapshot {
            self.rollback_snapshots
                .insert(operation.id.clone(), snapshot);
        }
        self.operations.push(operation);
    }
}
