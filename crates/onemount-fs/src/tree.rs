//! In-memory inode tree
//!
//! The filesystem engine's exclusive view of the directory tree: item id →
//! node, node id → item id, per-directory child indexes inside each inode,
//! and the per-file status map. Lookups are lock-free via DashMap; the
//! structural operations that touch several maps at once (insert, remove,
//! rename, server-id adoption) serialize on a single structure lock, and
//! each inode carries its own `RwLock` for content-bearing mutation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use tracing::debug;

use onemount_core::domain::{DriveItem, FileStatus, Inode, ItemId, RemoteError, StatusInfo};

/// Node id of the root inode.
pub const ROOT_NODE_ID: u64 = 1;

/// A tree node: the process-local node id plus the locked inode.
pub struct TreeNode {
    /// Monotonically assigned, unique process-wide, never persisted
    pub node_id: u64,
    /// The inode payload
    pub inode: RwLock<Inode>,
}

impl TreeNode {
    /// Reads a clone of the current inode state.
    pub fn snapshot(&self) -> Inode {
        self.inode.read().expect("inode lock poisoned").clone()
    }

    /// Runs `f` with the inode read-locked.
    pub fn with<R>(&self, f: impl FnOnce(&Inode) -> R) -> R {
        f(&self.inode.read().expect("inode lock poisoned"))
    }

    /// Runs `f` with the inode write-locked.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        f(&mut self.inode.write().expect("inode lock poisoned"))
    }
}

/// The in-memory directory tree.
pub struct InodeTree {
    nodes: DashMap<String, Arc<TreeNode>>,
    by_node_id: DashMap<u64, ItemId>,
    statuses: DashMap<String, StatusInfo>,
    conflicts: DashMap<String, ItemId>,
    next_node_id: AtomicU64,
    structure: Mutex<()>,
}

impl InodeTree {
    /// Creates a tree containing only the root inode.
    pub fn new() -> Self {
        let tree = Self {
            nodes: DashMap::new(),
            by_node_id: DashMap::new(),
            statuses: DashMap::new(),
            conflicts: DashMap::new(),
            next_node_id: AtomicU64::new(ROOT_NODE_ID + 1),
            structure: Mutex::new(()),
        };
        let root = Arc::new(TreeNode {
            node_id: ROOT_NODE_ID,
            inode: RwLock::new(Inode::new(DriveItem::root())),
        });
        tree.nodes.insert(ItemId::root().into_string(), root);
        tree.by_node_id.insert(ROOT_NODE_ID, ItemId::root());
        tree
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true when only the root exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Fetches a node by item id.
    pub fn get(&self, id: &ItemId) -> Option<Arc<TreeNode>> {
        self.nodes.get(id.as_str()).map(|r| Arc::clone(&r))
    }

    /// Fetches a node by its kernel-visible node id.
    pub fn get_by_node_id(&self, node_id: u64) -> Option<Arc<TreeNode>> {
        let id = self.by_node_id.get(&node_id)?.clone();
        self.get(&id)
    }

    /// Inserts an inode, assigning a fresh node id and linking it into its
    /// parent's child index. Upserts by item id keep the existing node id.
    pub fn insert(&self, inode: Inode) -> Arc<TreeNode> {
        let _structural = self.structure.lock().expect("structure lock poisoned");
        let id = inode.id().clone();
        let parent_id = inode.parent_id().cloned();
        let status = inode.status.clone();

        let node = if let Some(existing) = self.nodes.get(id.as_str()) {
            let node = Arc::clone(&existing);
            drop(existing);
            node.with_mut(|current| *current = inode);
            node
        } else {
            let node_id = self.next_node_id.fetch_add(1, Ordering::Relaxed);
            let node = Arc::new(TreeNode {
                node_id,
                inode: RwLock::new(inode),
            });
            self.nodes.insert(id.as_str().to_string(), Arc::clone(&node));
            self.by_node_id.insert(node_id, id.clone());
            node
        };

        self.statuses
            .entry(id.as_str().to_string())
            .or_insert_with(|| StatusInfo {
                status,
                error: None,
            });

        if let Some(parent_id) = parent_id {
            if let Some(parent) = self.nodes.get(parent_id.as_str()) {
                parent.with_mut(|p| p.link_child(id.clone()));
            }
        }
        node
    }

    /// Removes a node, unlinking it from its parent's child index.
    pub fn remove(&self, id: &ItemId) -> Option<Arc<TreeNode>> {
        let _structural = self.structure.lock().expect("structure lock poisoned");
        let (_, node) = self.nodes.remove(id.as_str())?;
        self.by_node_id.remove(&node.node_id);
        self.statuses.remove(id.as_str());

        if let Some(parent_id) = node.with(|i| i.parent_id().cloned()) {
            if let Some(parent) = self.nodes.get(parent_id.as_str()) {
                parent.with_mut(|p| p.unlink_child(id));
            }
        }
        debug!(id = %id, node_id = node.node_id, "inode removed");
        Some(node)
    }

    /// Looks up a child by name, case-insensitively (the remote service is
    /// case-preserving, case-insensitive). Tombstoned children are hidden.
    pub fn lookup_child(&self, parent: &ItemId, name: &str) -> Option<Arc<TreeNode>> {
        let parent_node = self.get(parent)?;
        let children = parent_node.with(|p| p.children.clone());
        let wanted = name.to_lowercase();
        for child_id in children {
            if let Some(child) = self.get(&child_id) {
                let (child_name, tombstone) =
                    child.with(|c| (c.name().to_lowercase(), c.tombstone));
                if !tombstone && child_name == wanted {
                    return Some(child);
                }
            }
        }
        None
    }

    /// Snapshot of a directory's visible children as `(id, name, is_dir)`.
    pub fn children_of(&self, parent: &ItemId) -> Vec<(ItemId, String, bool)> {
        let Some(parent_node) = self.get(parent) else {
            return Vec::new();
        };
        let children = parent_node.with(|p| p.children.clone());
        let mut out = Vec::with_capacity(children.len());
        for child_id in children {
            if let Some(child) = self.get(&child_id) {
                let (name, is_dir, tombstone) =
                    child.with(|c| (c.name().to_string(), c.is_dir(), c.tombstone));
                if !tombstone {
                    out.push((child_id, name, is_dir));
                }
            }
        }
        out
    }

    /// Moves a node under a new parent with a new name, updating both child
    /// indexes and the embedded parent reference.
    pub fn relink(
        &self,
        id: &ItemId,
        new_parent: &ItemId,
        new_name: &str,
    ) -> Result<(), RemoteError> {
        let _structural = self.structure.lock().expect("structure lock poisoned");
        let node = self
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let old_parent = node.with(|i| i.parent_id().cloned());

        if let Some(old_parent) = old_parent {
            if let Some(parent) = self.nodes.get(old_parent.as_str()) {
                parent.with_mut(|p| p.unlink_child(id));
            }
        }
        if let Some(parent) = self.nodes.get(new_parent.as_str()) {
            parent.with_mut(|p| p.link_child(id.clone()));
        }
        node.with_mut(|i| {
            i.item.name = new_name.to_string();
            if let Some(parent_ref) = i.item.parent_reference.as_mut() {
                parent_ref.id = Some(new_parent.clone());
            } else {
                i.item.parent_reference = Some(onemount_core::domain::ParentRef {
                    id: Some(new_parent.clone()),
                    path: None,
                });
            }
        });
        Ok(())
    }

    /// Rewrites a local id to the server-assigned id everywhere: node map,
    /// node-id map, status map, the parent's child index, and the children's
    /// parent references. One exclusive critical section; the node id is
    /// preserved so open kernel handles stay valid.
    pub fn adopt_remote_id(&self, old_id: &ItemId, item: DriveItem) -> Result<Arc<TreeNode>, RemoteError> {
        let _structural = self.structure.lock().expect("structure lock poisoned");
        let new_id = item.id.clone();
        let (_, node) = self
            .nodes
            .remove(old_id.as_str())
            .ok_or_else(|| RemoteError::NotFound(old_id.to_string()))?;

        node.with_mut(|i| {
            let children_enumerated = i.children_enumerated;
            let children = std::mem::take(&mut i.children);
            let mode = i.mode;
            let dirty = i.dirty;
            let status = i.status.clone();
            *i = Inode {
                item,
                children,
                children_enumerated,
                dirty,
                mode,
                tombstone: false,
                status,
            };
        });

        self.nodes
            .insert(new_id.as_str().to_string(), Arc::clone(&node));
        self.by_node_id.insert(node.node_id, new_id.clone());

        if let Some((_, info)) = self.statuses.remove(old_id.as_str()) {
            self.statuses.insert(new_id.as_str().to_string(), info);
        }

        // parent's child index
        if let Some(parent_id) = node.with(|i| i.parent_id().cloned()) {
            if let Some(parent) = self.nodes.get(parent_id.as_str()) {
                parent.with_mut(|p| {
                    for child in p.children.iter_mut() {
                        if child == old_id {
                            *child = new_id.clone();
                        }
                    }
                });
            }
        }

        // children's parent references (folders created offline)
        let child_ids = node.with(|i| i.children.clone());
        for child_id in child_ids {
            if let Some(child) = self.nodes.get(child_id.as_str()) {
                child.with_mut(|c| {
                    if let Some(parent_ref) = c.item.parent_reference.as_mut() {
                        parent_ref.id = Some(new_id.clone());
                    }
                });
            }
        }

        debug!(old = %old_id, new = %new_id, "server id adopted");
        Ok(node)
    }

    /// All item ids currently in the tree.
    pub fn ids(&self) -> Vec<ItemId> {
        self.nodes
            .iter()
            .map(|entry| entry.value().with(|i| i.id().clone()))
            .collect()
    }

    // ========================================================================
    // conflict pairs
    // ========================================================================

    /// Links an original with its materialized conflict copy, both ways.
    pub fn link_conflict(&self, original: &ItemId, copy: &ItemId) {
        self.conflicts
            .insert(original.as_str().to_string(), copy.clone());
        self.conflicts
            .insert(copy.as_str().to_string(), original.clone());
    }

    /// Resolves a conflict pair by one side's deletion: removes both links
    /// and returns the surviving peer, if any.
    pub fn take_conflict_peer(&self, deleted: &ItemId) -> Option<ItemId> {
        let (_, peer) = self.conflicts.remove(deleted.as_str())?;
        self.conflicts.remove(peer.as_str());
        Some(peer)
    }

    /// Returns the conflict peer without resolving the pair.
    pub fn conflict_peer(&self, id: &ItemId) -> Option<ItemId> {
        self.conflicts.get(id.as_str()).map(|r| r.clone())
    }

    // ========================================================================
    // statuses
    // ========================================================================

    /// Current status info for an item.
    pub fn status_of(&self, id: &ItemId) -> StatusInfo {
        self.statuses
            .get(id.as_str())
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Sets the status, returning the previous one. Also mirrors the status
    /// into the inode for persistence.
    pub fn set_status(&self, id: &ItemId, status: FileStatus) -> FileStatus {
        let mut entry = self.statuses.entry(id.as_str().to_string()).or_default();
        let previous = entry.status.clone();
        entry.set_status(status.clone());
        drop(entry);
        if let Some(node) = self.get(id) {
            node.with_mut(|i| i.status = status);
        }
        previous
    }

    /// Records a terminal error for an item.
    pub fn record_error(&self, id: &ItemId, err: &RemoteError) {
        let mut entry = self.statuses.entry(id.as_str().to_string()).or_default();
        entry.record_error(err);
        drop(entry);
        if let Some(node) = self.get(id) {
            node.with_mut(|i| i.status = FileStatus::Error);
        }
    }

    /// Status histogram for the stats view.
    pub fn status_counts(&self) -> Vec<(FileStatus, u64)> {
        let mut counts: Vec<(FileStatus, u64)> =
            FileStatus::all().into_iter().map(|s| (s, 0)).collect();
        for entry in self.statuses.iter() {
            for (status, count) in counts.iter_mut() {
                if *status == entry.status {
                    *count += 1;
                }
            }
        }
        counts
    }
}

impl Default for InodeTree {
    fn default() -> Self {
        Self::new()
    }
}
