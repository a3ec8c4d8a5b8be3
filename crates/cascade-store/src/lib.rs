//! Durable persistence for the engine.
//!
//! SQLite-backed store with tables for liquidations, orders, order
//! relationships, tranches, and fills. Writes are short single-statement
//! transactions; "database is busy" maps to a retryable error and is
//! absorbed by a bounded internal retry.

pub mod error;
pub mod records;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use records::{FillRow, OrderRelationship, TrancheRow};
pub use sqlite::SqliteStore;
pub use store::Store;
