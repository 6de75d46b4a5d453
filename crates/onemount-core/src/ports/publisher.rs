//! Status publisher port
//!
//! Per-file status is always exposed through extended attributes; this port
//! additionally fans status changes out to an optional desktop message bus.

use crate::domain::{FileStatus, ItemId};

/// Receives per-file status change events.
#[async_trait::async_trait]
pub trait IStatusPublisher: Send + Sync {
    /// Publishes a status change for an item.
    ///
    /// Implementations must not block the engine; failures are logged and
    /// swallowed by the caller.
    async fn publish(&self, id: &ItemId, path: &str, status: &FileStatus);
}

/// Publisher that drops every event, for mounts without a desktop bus.
pub struct NullPublisher;

#[async_trait::async_trait]
impl IStatusPublisher for NullPublisher {
    async fn publish(&self, _id: &ItemId, _path: &str, _status: &FileStatus) {}
}
