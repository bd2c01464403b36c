//! Persisted-state layer.
//!
//! The projection is persisted as opaque JSON blobs, one per top-level
//! namespace (`messenger`, `settings`, `groups`). The core writes through
//! after every reduced event and restores all namespaces before bootstrap.

pub mod database;
pub mod error;
pub mod store;

pub use database::Database;
pub use error::{Result, StoreError};
pub use store::{MemoryStore, Namespace, SqliteStore, StateStore};
