//! Eviction gate
//!
//! The cache's cleanup task asks this gate before deleting any blob: only
//! files whose status is `cloud` or `local` qualify, never dirty content,
//! never content with a pending upload session, never a file somebody holds
//! open. After an eviction the file's status drops back to `cloud`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tracing::debug;

use onemount_cache::EvictionGate;
use onemount_core::domain::{FileStatus, ItemId};
use onemount_store::MetadataStore;

use crate::tree::InodeTree;

/// Gate backed by the inode tree and the open-handle counts.
pub struct TreeEvictionGate {
    tree: Arc<InodeTree>,
    store: Arc<MetadataStore>,
    open_counts: Arc<DashMap<String, usize>>,
    rt: Handle,
}

impl TreeEvictionGate {
    pub fn new(
        tree: Arc<InodeTree>,
        store: Arc<MetadataStore>,
        open_counts: Arc<DashMap<String, usize>>,
        rt: Handle,
    ) -> Self {
        Self {
            tree,
            store,
            open_counts,
            rt,
        }
    }
}

impl EvictionGate for TreeEvictionGate {
    fn may_evict(&self, id: &str) -> bool {
        if self
            .open_counts
            .get(id)
            .is_some_and(|count| *count > 0)
        {
            return false;
        }
        let item_id = ItemId::from(id);
        let Some(node) = self.tree.get(&item_id) else {
            // orphaned blob with no inode; safe to drop
            return true;
        };
        if node.with(|i| i.dirty) {
            return false;
        }
        self.tree.status_of(&item_id).status.is_evictable()
    }

    fn on_evicted(&self, id: &str) {
        let item_id = ItemId::from(id);
        self.tree.set_status(&item_id, FileStatus::Cloud);
        if let Some(node) = self.tree.get(&item_id) {
            let snapshot = node.snapshot();
            let store = Arc::clone(&self.store);
            self.rt.spawn(async move {
                let _ = store.put_inode(&snapshot).await;
            });
        }
        debug!(id, "blob evicted, status back to cloud");
    }
}
