//! Inode entity
//!
//! The on-disk and in-memory representation of a tree node: a drive item
//! snapshot plus the local bookkeeping the server knows nothing about
//! (dirty bit, mode override, tombstone, child index, status). The
//! process-local node id lives in the filesystem layer and is never
//! persisted.

use serde::{Deserialize, Serialize};

use super::drive_item::DriveItem;
use super::newtypes::ItemId;
use super::status::FileStatus;

/// A tree node bound to a drive item snapshot.
///
/// Invariants maintained by the tree:
/// - the remote id, once server-assigned, is globally unique
/// - for a directory, every child id resolves to an inode whose parent id
///   equals this inode's id
/// - the root inode has id `root` and an empty parent path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    /// Embedded drive item snapshot (carries the remote or local id)
    pub item: DriveItem,
    /// Ordered child ids, for directories
    #[serde(default)]
    pub children: Vec<ItemId>,
    /// Whether `children` reflects a full server enumeration
    #[serde(default)]
    pub children_enumerated: bool,
    /// Local content differs from what the server has acknowledged
    #[serde(default)]
    pub dirty: bool,
    /// Locally-stored mode bits overriding the synthesized default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    /// Deleted locally while offline; hidden from readdir until replayed
    #[serde(default)]
    pub tombstone: bool,
    /// Last known status, persisted for crash recovery
    #[serde(default)]
    pub status: FileStatus,
}

impl Inode {
    /// Wraps a drive item into a fresh inode.
    #[must_use]
    pub fn new(item: DriveItem) -> Self {
        let status = FileStatus::Cloud;
        Self {
            item,
            children: Vec::new(),
            children_enumerated: false,
            dirty: false,
            mode: None,
            tombstone: false,
            status,
        }
    }

    /// The item id (remote or local).
    #[must_use]
    pub fn id(&self) -> &ItemId {
        &self.item.id
    }

    /// The name under the parent.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.item.name
    }

    /// The parent id, if known.
    #[must_use]
    pub fn parent_id(&self) -> Option<&ItemId> {
        self.item.parent_id()
    }

    /// Returns true for directories.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.item.is_dir()
    }

    /// Mode bits: the stored override, or the synthesized default
    /// (0o755 for directories, 0o644 for files).
    #[must_use]
    pub fn mode_bits(&self) -> u32 {
        self.mode
            .unwrap_or(if self.is_dir() { 0o755 } else { 0o644 })
    }

    /// Adds a child id if absent, preserving insertion order.
    pub fn link_child(&mut self, child: ItemId) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Removes a child id.
    pub fn unlink_child(&mut self, child: &ItemId) {
        self.children.retain(|c| c != child);
    }
}
