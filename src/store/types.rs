//! core types shared by every store implementation.

use async_trait::async_trait;
use serde_json::Value;

use crate::store::error::{StoreError, StoreResult};

/// Field holding a record's primary key.
pub const ID_FIELD: &str = "id";

/// The narrow client API the coordinator drives.
///
/// It offers single-record primitives only; there is no multi-statement
/// transaction. Records are JSON objects keyed by their `id` field.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a record by id.
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Insert a new record and return it as stored.
    ///
    /// A record without an `id` gets a generated one.
    async fn insert(&self, collection: &str, record: Value) -> StoreResult<Value>;

    /// Merge `patch` into an existing record and return the result.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<Value>;

    /// Remove a record, returning it if it existed.
    ///
    /// Deleting a missing record is not an error.
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Put a full record back, replacing whatever is stored under its id.
    async fn restore(&self, collection: &str, record: Value) -> StoreResult<()>;
}

/// Extract the primary key from a record.
pub fn record_id(record: &Value) -> Option<&str> {
    record.get(ID_FIELD).and_then(Value::as_str)
}

/// Validate a collection name.
///
/// Valid names:
/// - 1-64 characters
/// - Alphanumeric, underscores, hyphens only
/// - Must start with a letter or underscore
pub fn validate_collection(name: &str) -> StoreResult<()> {
    let invalid = |reason: &str| StoreError::InvalidCollection {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let Some(first) = name.chars().next() else {
        return Err(invalid("name is empty"));
    };
    if name.len() > 64 {
        return Err(invalid("name is longer than 64 characters"));
    }
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(invalid("name must start with a letter or underscore"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(invalid(&format!("invalid character {c:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id() {
        assert_eq!(record_id(&json!({"id": "d1", "price": 100})), Some("d1"));
        assert_eq!(record_id(&json!({"id": 7})), None);
        assert_eq!(record_id(&json!({"price": 100})), None);
    }

    #[test]
    fn test_collection_names() {
        assert!(validate_collection("deposits").is_ok());
        assert!(validate_collection("_audit-log").is_ok());
        assert!(validate_collection("").is_err());
        assert!(validate_collection("1deposits").is_err());
        assert!(validate_collection("../etc").is_err());
        assert!(validate_collection(&"a".repeat(65)).is_err());
    }
}
