//! The handle a transaction step uses to reach the store.
//!
//! Every mutation goes through [`TxScope`] so it lands in the operation log,
//! and updates and deletes read the current record before they touch it so
//! the rollback snapshot reflects the pre-mutation state.

use std::sync::Arc;

use serde_json::Value;
use tracing::{error, trace, warn};

use crate::store::{record_id, DocumentStore, StoreError};
use crate::transaction::compensation::CompensatingAction;
use crate::transaction::context::{Operation, OperationKind, TransactionId, TransactionMetadata};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::registry::TransactionRegistry;

/// Store access bound to one transaction attempt.
#[derive(Clone)]
pub struct TxScope {
    id: TransactionId,
    metadata: TransactionMetadata,
    registry: TransactionRegistry,
    store: Arc<dyn DocumentStore>,
}

impl TxScope {
    pub(crate) fn new(
        id: TransactionId,
        metadata: TransactionMetadata,
        registry: TransactionRegistry,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            id,
            metadata,
            registry,
            store,
        }
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.id
    }

    pub fn metadata(&self) -> &TransactionMetadata {
        &self.metadata
    }

    pub fn attempt(&self) -> u32 {
        self.metadata.attempt
    }

    /// Read a record. Reads are not logged.
    pub async fn get(&self, collection: &str, id: &str) -> TransactionResult<Option<Value>> {
        Ok(self.store.get(collection, id).await?)
    }

    /// Insert a record and log it; rollback deletes it again.
    pub async fn insert(&self, collection: &str, record: Value) -> TransactionResult<Value> {
        self.ensure_open()?;
        let stored = self.store.insert(collection, record).await?;
        let Some(id) = record_id(&stored).map(str::to_string) else {
            error!(tx_id = %self.id, collection, "inserted record has no id; cannot log it");
            return Err(TransactionError::Internal(
                "store returned a record without an id".into(),
            ));
        };

        let op = Operation::new(OperationKind::Insert, collection, id, stored.clone());
        self.log(op, None).await?;
        Ok(stored)
    }

    /// Update a record and log it; rollback restores the prior version.
    pub async fn update(&self, collection: &str, id: &str, patch: Value) -> TransactionResult<Value> {
        self.ensure_open()?;
        let snapshot = self
            .store
            .get(collection, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let updated = self.store.update(collection, id, patch).await?;
        let op = Operation::new(OperationKind::Update, collection, id, updated.clone());
        self.log(op, Some(snapshot)).await?;
        Ok(updated)
    }

    /// Delete a record and log it; rollback puts it back.
    ///
    /// Deleting a record that does not exist logs nothing and returns `None`.
    pub async fn delete(&self, collection: &str, id: &str) -> TransactionResult<Option<Value>> {
        self.ensure_open()?;
        let Some(snapshot) = self.store.get(collection, id).await? else {
            return Ok(None);
        };

        let Some(removed) = self.store.delete(collection, id).await? else {
            return Ok(None);
        };
        let op = Operation::new(OperationKind::Delete, collection, id, removed.clone());
        self.log(op, Some(snapshot)).await?;
        Ok(Some(removed))
    }

    pub(crate) fn ensure_open(&self) -> TransactionResult<()> {
        self.registry.ensure_open(&self.id)
    }

    /// Append to the log. If the context closed while the mutation was in
    /// flight, nobody will compensate it later, so undo it right here.
    async fn log(&self, op: Operation, snapshot: Option<Value>) -> TransactionResult<()> {
        let Err(e) = self.registry.append(&self.id, op.clone(), snapshot.clone()) else {
            trace!(tx_id = %self.id, operation_id = %op.id, kind = %op.kind, "operation logged");
            return Ok(());
        };

        warn!(
            tx_id = %self.id,
            collection = %op.collection,
            record_id = %op.record_id,
            "mutation landed after transaction closed; compensating"
        );
        match CompensatingAction::for_operation(&op, snapshot.as_ref()) {
            Ok(action) => {
                if let Err(ce) = action.apply(self.store.as_ref()).await {
                    error!(tx_id = %self.id, error = %ce, "late compensation failed");
                }
            }
            Err(ce) => error!(tx_id = %self.id, error = %ce, "late mutation cannot be compensated"),
        }
        Err(e)
    }
}

impl std::fmt::Debug for TxScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxScope")
            .field("id", &self.id)
            .field("attempt", &self.metadata.attempt)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use async_trait::async_trait;

    use crate::store::{MemoryStore, StoreResult, ID_FIELD};
    use crate::transaction::context::TransactionContext;
    use crate::transaction::isolation::IsolationLevel;

    fn setup() -> (MemoryStore, TransactionRegistry, TxScope) {
        let store = MemoryStore::new();
        let registry = TransactionRegistry::new();
        let ctx = TransactionContext::new(IsolationLevel::default(), TransactionMetadata::new());
        let id = registry.insert(ctx);
        let scope = TxScope::new(
            id,
            TransactionMetadata::new(),
            registry.clone(),
            Arc::new(store.clone()),
        );
        (store, registry, scope)
    }

    #[tokio::test]
    async fn test_update_captures_snapshot_before_mutation() {
        let (store, registry, scope) = setup();
        store
            .insert("deposits", json!({"id": "d1", "price": 100}))
            .await
            .unwrap();

        let updated = scope
            .update("deposits", "d1", json!({"price": 200}))
            .await
            .unwrap();
        assert_eq!(updated["price"], 200);

        let ctx = registry.get(scope.transaction_id()).unwrap();
        let op = &ctx.operations[0];
        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(ctx.rollback_snapshots[&op.id]["price"], 100);
    }

    #[tokio::test]
    async fn test_insert_and_delete_logged() {
        let (_store, registry, scope) = setup();
        let stored = scope.insert("deposits", json!({"price": 5})).await.unwrap();
        let id = record_id(&stored).unwrap().to_string();

        let removed = scope.delete("deposits", &id).await.unwrap().unwrap();
        assert_eq!(removed, stored);
        assert!(scope.delete("deposits", &id).await.unwrap().is_none());

        let ctx = registry.get(scope.transaction_id()).unwrap();
        let kinds: Vec<_> = ctx.operations.iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![OperationKind::Insert, OperationKind::Delete]);
        assert_eq!(ctx.rollback_snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let (_store, registry, scope) = setup();
        let err = scope
            .update("deposits", "ghost", json!({"price": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransactionError::Store(StoreError::NotFound { .. })));
        assert!(registry
            .get(scope.transaction_id())
            .unwrap()
            .operations
            .is_empty());
    }

    #[tokio::test]
    async fn test_closed_scope_rejects_mutations() {
        let (store, registry, scope) = setup();
        registry.claim(scope.transaction_id()).unwrap();

        let err = scope.insert("deposits", json!({"id": "d1"})).await.unwrap_err();
        assert!(matches!(err, TransactionError::NotActive { .. }));
        assert_eq!(store.len("deposits"), 0);
    }

    #[tokio::test]
    async fn test_late_mutation_is_self_compensated() {
        let (store, registry, scope) = setup();
        store
            .insert("deposits", json!({"id": "d1", "price": 100}))
            .await
            .unwrap();

        // Closes between the pre-check and the append, as a timeout would.
        let late = async {
            scope.ensure_open().unwrap();
            let snapshot = store.get("deposits", "d1").await.unwrap();
            store
                .update("deposits", "d1", json!({"price": 999}))
                .await
                .unwrap();
            registry.claim(scope.transaction_id()).unwrap();
            let op = Operation::new(OperationKind::Update, "deposits", "d1", json!({}));
            scope.log(op, snapshot).await
        };
        assert!(late.await.is_err());
        assert_eq!(
            store.get("deposits", "d1").await.unwrap().unwrap()["price"],
            100
        );
    }

    /// Store that forgets to echo the id back on insert.
    struct IdlessStore(MemoryStore);

    #[async_trait]
    impl DocumentStore for IdlessStore {
        async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
            self.0.get(collection, id).await
        }

        async fn insert(&self, collection: &str, record: Value) -> StoreResult<Value> {
            let mut stored = self.0.insert(collection, record).await?;
            if let Some(fields) = stored.as_object_mut() {
                fields.remove(ID_FIELD);
            }
            Ok(stored)
        }

        async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<Value> {
            self.0.update(collection, id, patch).await
        }

        async fn delete(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
            self.0.delete(collection, id).await
        }

        async fn restore(&self, collection: &str, record: Value) -> StoreResult<()> {
            self.0.restore(collection, record).await
        }
    }

    #[tokio::test]
    async fn test_insert_without_returned_id_is_not_retried() {
        let memory = MemoryStore::new();
        let registry = TransactionRegistry::new();
        let id = registry.insert(TransactionContext::new(
            IsolationLevel::default(),
            TransactionMetadata::new(),
        ));
        let scope = TxScope::new(
            id,
            TransactionMetadata::new(),
            registry.clone(),
            Arc::new(IdlessStore(memory.clone())),
        );

        let err = scope.insert("deposits", json!({"price": 1})).await.unwrap_err();
        assert!(matches!(err, TransactionError::Internal(_)));
        assert!(!err.is_retryable());
        // The write landed but could not be logged.
        assert_eq!(memory.len("deposits"), 1);
        assert!(registry
            .get(scope.transaction_id())
            .unwrap()
            .operations
            .is_empty());
    }
}
