//! store layer for txsaga
//!
//! This module defines the narrow, non-transactional client API the coordinator
//! works against. Upper layers only ever see [`DocumentStore`]; the bundled
//! [`MemoryStore`] backs tests and embedded use.
//!
//! # Usage
//!
//! ```ignore
//! use txsaga::store::{DocumentStore, MemoryStore};
//!
//! let store = MemoryStore::new();
//! let deposit = store.insert("deposits", json!({"price": 100})).await?;
//! let id = record_id(&deposit).unwrap();
//! store.update("deposits", id, json!({"price": 200})).await?;
//! ```

mod error;
mod memory;
mod types;

// Re-export public API
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use types::{record_id, validate_collection, DocumentStore, ID_FIELD};
