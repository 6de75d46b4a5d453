//! OneMount Cache - disk-backed content storage
//!
//! Stores file content keyed by remote item id, one blob file per id under
//! `content/`. Writers are exclusive per id and mutually exclusive with
//! readers; in-progress downloads land in a `.partial` sibling and are
//! promoted over the canonical blob only after the QuickXorHash verifies.
//!
//! A background cleanup task evicts blobs that have gone unused past the
//! configured age, consulting an [`EvictionGate`] so dirty or open content
//! is never touched.

pub mod cache;
pub mod eviction;

pub use cache::{BlobWriter, CacheEntry, ContentCache};
pub use eviction::{CleanupHandle, EvictionGate};

use thiserror::Error;

/// Errors from the content cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The blob does not exist
    #[error("no cached content for {0}")]
    NotCached(String),

    /// Filesystem failure
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hash verification failed during promotion
    #[error("content hash mismatch for {id}: expected {expected}, computed {computed}")]
    HashMismatch {
        id: String,
        expected: String,
        computed: String,
    },
}
