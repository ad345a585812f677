//! txsaga - application-level transactions over non-transactional stores
//!
//! This crate coordinates multi-step write sequences against a store that
//! only offers single-record primitives. Steps run in order; if one fails,
//! every mutation already made is undone with a compensating action, and the
//! whole sequence may be retried with backoff.
//!
//! It is at-least-once-with-compensation, not ACID. See [`transaction`] for
//! the exact guarantees.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use serde_json::json;
//! use txsaga::store::MemoryStore;
//! use txsaga::transaction::{step, ExecuteOptions, TransactionCoordinator, TxScope};
//!
//! # async fn run() {
//! let coordinator = TransactionCoordinator::new(Arc::new(MemoryStore::new()));
//! let outcome = coordinator
//!     .execute_transaction(
//!         vec![step(|tx: TxScope| async move {
//!             tx.insert("deposits", json!({"price": 100})).await
//!         })],
//!         ExecuteOptions::new(),
//!     )
//!     .await;
//! assert!(outcome.success);
//! # }
//! ```

pub mod store;
pub mod transaction;

#[cfg(test)]
mod testing;
