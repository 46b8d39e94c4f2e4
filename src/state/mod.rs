//! Persistent item store.
//!
//! SQLite-backed tracking of every media item discovered in MediaHaven and
//! the outcome of its metadata update request. Enables:
//! - Idempotent discovery (an id is inserted once, ever)
//! - Resuming an interrupted update phase where it stopped
//! - Progress reporting by status
//! - A history of sync runs

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{ItemStore, SqliteItemStore};
pub use error::StateError;
pub use types::{ItemStatus, SyncRunRecord, SyncRunStats, TrackedItem};
