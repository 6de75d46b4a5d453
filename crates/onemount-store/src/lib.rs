//! OneMount Store - durable metadata persistence
//!
//! SQLite-backed store with one named collection per concern:
//! - `inodes` - remote id → serialized inode
//! - `delta` - the delta cursor
//! - `uploads` - in-flight upload sessions, rehydrated on restart
//! - `offline` - the append-only offline-change journal
//! - `config` - small configuration blobs (quota record, tunables)
//!
//! Single-key writes are atomic and durable upon return; batched writes per
//! collection commit all-or-nothing; iteration yields a consistent snapshot.

pub mod lockfile;
pub mod pool;
pub mod store;

pub use pool::DatabasePool;
pub use store::MetadataStore;

use thiserror::Error;

/// Errors from the metadata store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be opened or the lock not acquired
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Schema migration failed
    #[error("migration failed: {0}")]
    MigrationFailed(String),

    /// A query failed
    #[error("query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A stored value could not be (de)serialized
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
