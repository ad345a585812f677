//! Recording test doubles shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::store::{record_id, DocumentStore, MemoryStore, StoreError, StoreResult};
use crate::transaction::{
    AuditEntry, AuditSink, CacheInvalidator, HookError, OperationKind, SearchIndexer, Sleeper,
};

/// A store call as seen by [`RecordingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Get(String, String),
    Insert(String, String),
    Update(String, String),
    Delete(String, String),
    Restore(String, String),
}

struct InsertFault {
    collection: String,
    remaining: usize,
    error: fn() -> StoreError,
}

#[derive(Default)]
struct Faults {
    restore: Option<String>,
    restore_panics: bool,
    delete: Option<String>,
    delete_delay: Option<Duration>,
    insert: Option<InsertFault>,
    insert_delay: Option<Duration>,
}

/// [`MemoryStore`] wrapper that records calls and injects failures.
#[derive(Clone, Default)]
pub(crate) struct RecordingStore {
    inner: MemoryStore,
    calls: Arc<Mutex<Vec<Call>>>,
    faults: Arc<Mutex<Faults>>,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub(crate) fn fail_restores(&self, message: &str) {
        self.faults.lock().restore = Some(message.to_string());
    }

    pub(crate) fn panic_on_restores(&self) {
        self.faults.lock().restore_panics = true;
    }

    /// Make every delete wait before it runs.
    pub(crate) fn delay_deletes(&self, delay: Duration) {
        self.faults.lock().delete_delay = Some(delay);
    }

    pub(crate) fn fail_deletes(&self, message: &str) {
        self.faults.lock().delete = Some(message.to_string());
    }

    /// Fail the next `times` inserts into `collection`.
    pub(crate) fn fail_inserts(&self, collection: &str, times: usize, error: fn() -> StoreError) {
        self.faults.lock().insert = Some(InsertFault {
            collection: collection.to_string(),
            remaining: times,
            error,
        });
    }

    /// Make every insert wait before it lands.
    pub(crate) fn delay_inserts(&self, delay: Duration) {
        self.faults.lock().insert_delay = Some(delay);
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        self.record(Call::Get(collection.into(), id.into()));
        self.inner.get(collection, id).await
    }

    async fn insert(&self, collection: &str, record: Value) -> StoreResult<Value> {
        let id = record_id(&record).unwrap_or_default().to_string();
        self.record(Call::Insert(collection.into(), id));

        let delay = {
            let mut faults = self.faults.lock();
            if let Some(fault) = faults.insert.as_mut() {
                if fault.collection == collection && fault.remaining > 0 {
                    fault.remaining -= 1;
                    return Err((fault.error)());
                }
            }
            faults.insert_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.insert(collection, record).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<Value> {
        self.record(Call::Update(collection.into(), id.into()));
        self.inner.update(collection, id, patch).await
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<Option<Value>> {
        self.record(Call::Delete(collection.into(), id.into()));
        let (failure, delay) = {
            let faults = self.faults.lock();
            (faults.delete.clone(), faults.delete_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = failure {
            return Err(StoreError::Other(message));
        }
        self.inner.delete(collection, id).await
    }

    async fn restore(&self, collection: &str, record: Value) -> StoreResult<()> {
        let id = record_id(&record).unwrap_or_default().to_string();
        self.record(Call::Restore(collection.into(), id));
        let (failure, panics) = {
            let faults = self.faults.lock();
            (faults.restore.clone(), faults.restore_panics)
        };
        if panics {
            panic!("restore crashed");
        }
        if let Some(message) = failure {
            return Err(StoreError::Other(message));
        }
        self.inner.restore(collection, record).await
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Default)]
pub(crate) struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub(crate) fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().push(duration);
    }
}

/// Records every collaborator call; optionally fails or panics on them all.
#[derive(Default)]
pub(crate) struct RecordingHooks {
    pub(crate) invalidated: Mutex<Vec<String>>,
    pub(crate) indexed: Mutex<Vec<(OperationKind, String, Value)>>,
    pub(crate) audited: Mutex<Vec<AuditEntry>>,
    fail: bool,
    panic: bool,
}

impl RecordingHooks {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn panicking() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    fn check(&self, what: &str) -> Result<(), HookError> {
        if self.panic {
            panic!("{what} crashed");
        }
        if self.fail {
            Err(HookError::new(format!("{what} unavailable")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheInvalidator for RecordingHooks {
    async fn invalidate(&self, pattern: &str) -> Result<(), HookError> {
        self.invalidated.lock().push(pattern.to_string());
        self.check("cache")
    }
}

#[async_trait]
impl SearchIndexer for RecordingHooks {
    async fn handle_change(
        &self,
        kind: OperationKind,
        collection: &str,
        record: &Value,
    ) -> Result<(), HookError> {
        self.indexed
            .lock()
            .push((kind, collection.to_string(), record.clone()));
        self.check("search")
    }
}

#[async_trait]
impl AuditSink for RecordingHooks {
    async fn append(&self, entry: AuditEntry) -> Result<(), HookError> {
        self.audited.lock().push(entry);
        self.check("audit")
    }
}
