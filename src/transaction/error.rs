//! Transaction error types.

use std::any::Any;
use std::fmt;

use thiserror::Error;

use crate::store::StoreError;
use crate::transaction::context::TransactionStatus;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Store primitive error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Transaction was already committed, rolled back or is closing.
    #[error("transaction {tx_id} is not active (status: {status})")]
    NotActive {
        tx_id: String,
        status: TransactionStatus,
    },

    /// Transaction not found in the registry.
    #[error("transaction not found: {0}")]
    NotFound(String),

    /// The attempt did not finish within its time budget.
    #[error("transaction {tx_id} timed out after {elapsed_ms}ms")]
    Timeout { tx_id: String, elapsed_ms: u64 },

    /// Payload rejected before it reached the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Error raised by a caller-supplied step.
    #[error("{0}")]
    Step(String),

    /// A step task panicked or was cancelled.
    #[error("step aborted: {0}")]
    Aborted(String),

    /// Internal error.
    #[error("internal transaction error: {0}")]
    Internal(String),
}

/// Coarse error classes driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup or momentary backend unavailability.
    Transient,
    /// Unique or foreign-key constraint violation.
    Constraint,
    /// Malformed payload.
    Validation,
    /// Permission denied.
    Permission,
    /// The attempt ran out of time.
    Timeout,
    /// The transaction was in the wrong state for the request.
    State,
    /// A broken invariant inside the coordinator or the store; the store may
    /// hold a write nobody logged, so another attempt could duplicate it.
    Internal,
}

impl ErrorClass {
    /// Whether an error of this class is worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Timeout)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Constraint => "constraint",
            ErrorClass::Validation => "validation",
            ErrorClass::Permission => "permission",
            ErrorClass::Timeout => "timeout",
            ErrorClass::State => "state",
            ErrorClass::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Message fragments marking an error that retrying cannot fix.
const CONSTRAINT_MARKERS: &[&str] = &[
    "duplicate key",
    "unique constraint",
    "already exists",
    "foreign key",
    "violates",
];
const PERMISSION_MARKERS: &[&str] = &["permission denied", "not authorized", "forbidden"];
const VALIDATION_MARKERS: &[&str] = &["validation", "invalid input", "malformed"];

/// Classify an opaque error message by its non-retryable markers.
pub fn classify_message(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| message.contains(m));
    if has(CONSTRAINT_MARKERS) {
        ErrorClass::Constraint
    } else if has(PERMISSION_MARKERS) {
        ErrorClass::Permission
    } else if has(VALIDATION_MARKERS) {
        ErrorClass::Validation
    } else {
        ErrorClass::Transient
    }
}

impl TransactionError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransactionError::Store(e) if e.is_constraint() => ErrorClass::Constraint,
            TransactionError::Store(e) if e.is_retriable() => ErrorClass::Transient,
            TransactionError::Store(StoreError::PermissionDenied(_)) => ErrorClass::Permission,
            TransactionError::Store(StoreError::Other(msg)) => classify_message(msg),
            TransactionError::Store(_) => ErrorClass::Validation,
            TransactionError::NotActive { .. } | TransactionError::NotFound(_) => {
                ErrorClass::State
            }
            TransactionError::Timeout { .. } => ErrorClass::Timeout,
            TransactionError::Validation(_) => ErrorClass::Validation,
            TransactionError::Internal(_) => ErrorClass::Internal,
            TransactionError::Step(msg) | TransactionError::Aborted(msg) => classify_message(msg),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Create a step error from anything printable.
    pub fn step(message: impl fmt::Display) -> Self {
        Self::Step(message.to_string())
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
