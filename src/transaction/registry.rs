//! Registry of in-flight transaction contexts.
//!
//! The registry is the only shared mutable state of the coordinator. It is an
//! explicitly constructed object rather than a process-wide singleton, so each
//! coordinator (and each test) can own an isolated one, or several
//! coordinators can deliberately share one.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::transaction::context::{
    Operation, TransactionContext, TransactionId, TransactionStatus,
};
use crate::transaction::error::{TransactionError, TransactionResult};

/// Terminal statuses remembered after removal, oldest evicted first.
const FINISHED_CAPACITY: usize = 1024;

#[derive(Default)]
struct RegistryInner {
    contexts: HashMap<TransactionId, TransactionContext>,
    finished: Finished,
}

type Finished = VecDeque<(TransactionId, TransactionStatus)>;

fn finished_status(finished: &Finished, id: &TransactionId) -> Option<TransactionStatus> {
    finished
        .iter()
        .rev()
        .find(|(done, _)| done == id)
        .map(|(_, status)| *status)
}

/// Error for an id with no live context: finished ones report their status.
fn missing(finished: &Finished, id: &TransactionId) -> TransactionError {
    match finished_status(finished, id) {
        Some(status) => TransactionError::NotActive {
            tx_id: id.to_string(),
            status,
        },
        None => TransactionError::NotFound(id.to_string()),
    }
}

/// Thread-safe map from transaction id to context.
///
/// Cheap to clone; clones share the same map. The lock is never held across
/// an await point.
#[derive(Clone, Default)]
pub struct TransactionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context and return its id.
    pub fn insert(&self, context: TransactionContext) -> TransactionId {
        let id = context.id.clone();
        self.inner.write().contexts.insert(id.clone(), context);
        id
    }

    /// Snapshot of a registered context.
    pub fn get(&self, id: &TransactionId) -> Option<TransactionContext> {
        self.inner.read().contexts.get(id).cloned()
    }

    /// Whether the context exists and still accepts operations.
    pub fn accepts_operations(&self, id: &TransactionId) -> bool {
        self.inner
            .read()
            .contexts
            .get(id)
            .is_some_and(TransactionContext::accepts_operations)
    }

    /// Ok if the context still accepts operations, otherwise why not.
    pub(crate) fn ensure_open(&self, id: &TransactionId) -> TransactionResult<()> {
        let inner = self.inner.read();
        match inner.contexts.get(id) {
            Some(ctx) if ctx.accepts_operations() => Ok(()),
            Some(ctx) => Err(not_active(ctx)),
            None => Err(missing(&inner.finished, id)),
        }
    }

    /// All contexts still in the active state.
    pub fn list_active(&self) -> Vec<TransactionContext> {
        let mut active: Vec<_> = self
            .inner
            .read()
            .contexts
            .values()
            .filter(|ctx| ctx.status == TransactionStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|ctx| ctx.start_time);
        active
    }

    /// Append an operation to an open context. Returns the new log length.
    pub(crate) fn append(
        &self,
        id: &TransactionId,
        operation: Operation,
        snapshot: Option<Value>,
    ) -> TransactionResult<usize> {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let ctx = inner
            .contexts
            .get_mut(id)
            .ok_or_else(|| missing(&inner.finished, id))?;
        if !ctx.accepts_operations() {
            return Err(not_active(ctx));
        }
        ctx.push(operation, snapshot);
        Ok(ctx.operations.len())
    }

    /// Atomically take ownership of an active context for commit or rollback.
    ///
    /// The context stays registered (still `Active`) but stops accepting
    /// operations. Only one caller can claim a given context.
    pub(crate) fn claim(&self, id: &TransactionId) -> TransactionResult<TransactionContext> {
        self.claim_as(id, TransactionStatus::Active)
    }

    /// Claim a context and mark it committed under the same lock.
    pub(crate) fn claim_committed(
        &self,
        id: &TransactionId,
    ) -> TransactionResult<TransactionContext> {
        self.claim_as(id, TransactionStatus::Committed)
    }

    fn claim_as(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> TransactionResult<TransactionContext> {
        let mut inner = self.inner.write();
        let inner = &mut *inner;
        let ctx = inner
            .contexts
            .get_mut(id)
            .ok_or_else(|| missing(&inner.finished, id))?;
        if !ctx.accepts_operations() {
            return Err(not_active(ctx));
        }
        ctx.closing_since = Some(Utc::now());
        ctx.status = status;
        Ok(ctx.clone())
    }

    /// Drop a context, remembering its final status.
    pub(crate) fn remove(&self, id: &TransactionId) -> Option<TransactionContext> {
        let mut inner = self.inner.write();
        let ctx = inner.contexts.remove(id)?;
        remember(&mut inner.finished, &ctx);
        Some(ctx)
    }

    /// Drop a claimed context whose owner never finished it. A context still
    /// `Active` ends `Failed`, since its compensation state is unknown; one
    /// already marked terminal keeps its status.
    pub(crate) fn evict(&self, id: &TransactionId) -> Option<TransactionContext> {
        let mut inner = self.inner.write();
        let mut ctx = inner.contexts.remove(id)?;
        if !ctx.status.is_terminal() {
            ctx.status = TransactionStatus::Failed;
        }
        remember(&mut inner.finished, &ctx);
        Some(ctx)
    }

    /// Set the terminal status of a claimed context and drop it.
    pub(crate) fn finish(
        &self,
        id: &TransactionId,
        status: TransactionStatus,
    ) -> Option<TransactionContext> {
        let mut inner = self.inner.write();
        let mut ctx = inner.contexts.remove(id)?;
        ctx.status = status;
        remember(&mut inner.finished, &ctx);
        Some(ctx)
    }

    /// Ids of unclaimed active contexts older than `max_age` at `now`.
    pub fn stale(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> Vec<TransactionId> {
        self.inner
            .read()
            .contexts
            .values()
            .filter(|ctx| ctx.accepts_operations() && ctx.age(now) > max_age)
            .map(|ctx| ctx.id.clone())
            .collect()
    }

    /// Ids of claimed contexts whose commit or rollback started more than
    /// `max_age` before `now` and has not finished.
    pub fn stuck_closing(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Vec<TransactionId> {
        self.inner
            .read()
            .contexts
            .values()
            .filter(|ctx| ctx.closing_since.is_some_and(|since| now - since > max_age))
            .map(|ctx| ctx.id.clone())
            .collect()
    }

    /// Final status of a recently finished context.
    pub fn final_status(&self, id: &TransactionId) -> Option<TransactionStatus> {
        finished_status(&self.inner.read().finished, id)
    }

    /// Start time of the oldest registered context.
    pub fn oldest_start(&self) -> Option<DateTime<Utc>> {
        self.inner
            .read()
            .contexts
            .values()
            .map(|ctx| ctx.start_time)
            .min()
    }

    pub fn len(&self) -> usize {
        self.inner.read().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().contexts.is_empty()
    }
}

fn remember(finished: &mut Finished, ctx: &TransactionContext) {
    if finished.len() == FINISHED_CAPACITY {
        finished.pop_front();
    }
    finished.push_back((ctx.id.clone(), ctx.status));
}

fn not_active(ctx: &TransactionContext) -> TransactionError {
    TransactionError::NotActive {
        tx_id: ctx.id.to_string(),
        status: ctx.status,
    }
}

impl std::fmt::Debug for TransactionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
