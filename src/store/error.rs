//! Store error types
//!
//! All errors a backend primitive can report are defined here.
//! We use `thiserror` for ergonomic error definition and better error messages

use thiserror::Error;

/// the main error type for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// the record id already exists in the collection
    #[error("duplicate key: unique constraint violated on {collection}/{id}")]
    UniqueViolation { collection: String, id: String },

    /// a referenced record does not exist
    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// the requested record was not found
    #[error("record not found: collection={collection}, id={id}")]
    NotFound { collection: String, id: String },

    /// the caller may not perform this operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// the payload failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// the backend is temporarily unreachable
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// invalid collection name
    #[error("invalid collection name {name:?}: {reason}")]
    InvalidCollection { name: String, reason: String },

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// anything the backend reports that has no better home
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// check if this error is a constraint violation
    pub fn is_constraint(&self) -> bool {
        matches!(
            self,
            StoreError::UniqueViolation { .. } | StoreError::ForeignKeyViolation(_)
        )
    }

    /// check if this error is recoverable by retry
    ///
    /// a missing record counts: it may appear once a concurrent writer lands
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::NotFound { .. })
    }
}

/// result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
