//! In-memory document store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use ulid::Ulid;

use crate::store::error::{StoreError, StoreResult};
use crate::store::types::{record_id, validate_collection, DocumentStore, ID_FIELD};

type Collections = HashMap<String, BTreeMap<String, Value>>;

/// A thread-safe in-memory [`DocumentStore`].
///
/// Cheap to clone; clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// All records of a collection, ordered by id.
    pub fn snapshot(&self, collection: &str) -> Vec<Value> {
        self.collections
            .read()
            .get(collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn require_object(record: &Value) -> StoreResult<()> {
        if record.is_object() {
            Ok(())
        } else {
            Err(StoreError::Validation(
                "record must be a JSON object".to_string(),
            ))
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|rows| rows.get(id))
            .cloned())
    }

    async fn insert(&self, collection: &str, mut record: Value) -> StoreResult<Value> {
        validate_collection(collection)?;
        Self::require_object(&record)?;

        let id = match record_id(&record) {
            Some(id) => id.to_string(),
            None => {
                let id = Ulid::new().to_string().to_lowercase();
                record[ID_FIELD] = Value::String(id.clone());
                id
            }
        };

        let mut collections = self.collections.write();
        let rows = collections.entry(collection.to_string()).or_default();
        if rows.contains_key(&id) {
            return Err(StoreError::UniqueViolation {
                collection: collection.to_string(),
                id,
            });
        }
        rows.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<Value> {
        validate_collection(collection)?;
        let Value::Object(fields) = patch else {
            return Err(StoreError::Validation(
                "update patch must be a JSON object".to_string(),
            ));
        };
        if fields
            .get(ID_FIELD)
            .is_some_and(|v| v.as_str() != Some(id))
        {
            return Err(StoreError::Validation(
                "update patch may not change the record id".to_string(),
            ));
        }

        let mut collections = self.collections.write();
        let record = collections
            .get_mut(collection)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        if let Value::Object(existing) = record {
            for (k, v) in fields {
                existing.insert(k, v);
            }
        }
        Ok(record.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        validate_collection(collection)?;
        Ok(self
            .collections
            .write()
            .get_mut(collection)
            .and_then(|rows| rows.remove(id)))
    }

    async fn restore(&self, collection: &str, record: Value) -> StoreResult<()> {
        validate_collection(collection)?;
        Self::require_object(&record)?;
        let id = record_id(&record)
            .ok_or_else(|| StoreError::Validation("restored record has no id".to_string()))?
            .to_string();

        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("collections", &self.collections.read().len())
            .finish()
    }
}
