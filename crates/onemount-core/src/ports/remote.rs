//! Remote client port (driven/secondary port)
//!
//! The typed, retry-neutral facade over the object-metadata service. Retry
//! policy lives one layer up (upload/download managers, delta loop); this
//! interface only surfaces categorized [`RemoteError`]s.
//!
//! ## Design Notes
//!
//! - Child listings and delta queries drain the service's paged
//!   continuations internally and return complete batches.
//! - `download` streams into a caller-provided sink so large content never
//!   materializes in memory.
//! - Implementations attach bearer tokens from an [`ITokenProvider`] and map
//!   HTTP status codes onto the tagged error kinds.
//!
//! [`ITokenProvider`]: super::token::ITokenProvider

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::domain::{DeltaCursor, DriveItem, ItemId, RemoteError, UploadEndpoint};

/// Addressing for an upload: either replacing an existing item's content or
/// creating a new child under a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Replace the content of an existing item
    Existing(ItemId),
    /// Create (or overwrite by name) a child of `parent_id`
    NewChild { parent_id: ItemId, name: String },
}

/// Outcome of one chunk PUT within a resumable session.
#[derive(Debug, Clone)]
pub enum ChunkOutcome {
    /// Chunk accepted; the server expects `next_offset` next
    Accepted { next_offset: u64 },
    /// Final chunk accepted; the item is complete
    Complete(Box<DriveItem>),
}

/// One fully-drained delta query: every changed item plus the cursor for the
/// next invocation.
#[derive(Debug, Clone)]
pub struct DeltaBatch {
    /// Changed items, each either an update or a deletion marker
    pub items: Vec<DriveItem>,
    /// Cursor identifying the point after these changes
    pub cursor: DeltaCursor,
}

/// Drive quota aggregate for `statfs`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DriveQuota {
    /// Total storage in bytes
    pub total: u64,
    /// Used storage in bytes
    pub used: u64,
}

/// Health of the optional push channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushHealth {
    /// Heartbeats arriving on schedule
    Healthy,
    /// Two consecutive heartbeats missed
    Degraded,
    /// The transport is down and reconnecting
    Failed,
    /// No push channel configured
    #[default]
    Disabled,
}

/// Port trait for the object-metadata service.
#[async_trait::async_trait]
pub trait IRemoteClient: Send + Sync {
    /// Fetches an item by id.
    async fn get_item(&self, id: &ItemId) -> Result<DriveItem, RemoteError>;

    /// Fetches an item by drive-root-relative path (e.g. `/Documents/a.txt`).
    async fn get_item_by_path(&self, path: &str) -> Result<DriveItem, RemoteError>;

    /// Fetches a named child of a parent.
    async fn get_child(&self, parent_id: &ItemId, name: &str) -> Result<DriveItem, RemoteError>;

    /// Lists all children of a folder, draining paged continuations.
    async fn list_children(&self, parent_id: &ItemId) -> Result<Vec<DriveItem>, RemoteError>;

    /// Creates a folder under a parent.
    ///
    /// `conflict_behavior` is the service hint: `rename`, `replace`, or
    /// `fail`.
    async fn create_folder(
        &self,
        parent_id: &ItemId,
        name: &str,
        conflict_behavior: &str,
    ) -> Result<DriveItem, RemoteError>;

    /// Deletes an item.
    async fn delete(&self, id: &ItemId) -> Result<(), RemoteError>;

    /// Renames and/or moves an item.
    async fn rename_move(
        &self,
        id: &ItemId,
        new_parent_id: &ItemId,
        new_name: &str,
    ) -> Result<DriveItem, RemoteError>;

    /// Streams an item's content into `sink`, returning the byte count.
    ///
    /// Reads against the pre-authenticated URL returned with the item; the
    /// implementation refetches the item if that URL has expired.
    async fn download(
        &self,
        id: &ItemId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError>;

    /// Uploads content below the small-upload threshold in one request.
    ///
    /// `if_match` carries the ETag precondition for replace-style uploads;
    /// a mismatch surfaces as `RemoteError::Conflict`.
    async fn upload_small(
        &self,
        target: &UploadTarget,
        bytes: &[u8],
        if_match: Option<&str>,
    ) -> Result<DriveItem, RemoteError>;

    /// Opens a resumable chunked upload session.
    async fn start_chunked_upload(
        &self,
        target: &UploadTarget,
    ) -> Result<UploadEndpoint, RemoteError>;

    /// Uploads one chunk; `offset..offset+bytes.len()` of `total` bytes.
    async fn put_chunk(
        &self,
        endpoint: &UploadEndpoint,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, RemoteError>;

    /// Abandons a chunked upload session.
    async fn cancel_chunked_upload(&self, endpoint: &UploadEndpoint) -> Result<(), RemoteError>;

    /// Queries changes since `cursor` (everything when `None`), draining all
    /// pages.
    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaBatch, RemoteError>;

    /// Fetches the drive quota aggregate.
    async fn get_drive_quota(&self) -> Result<DriveQuota, RemoteError>;
}
