//! Delta loop body
//!
//! One invocation: query the delta cursor, drain the pages, reconcile every
//! changed item into the inode tree (upserts, deletions, conflict checks),
//! persist the new cursor atomically, and on an offline→online transition
//! replay the offline journal in append order.
//!
//! Reconciliation is idempotent: applying the same delta batch twice is a
//! no-op on the tree.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use onemount_cache::ContentCache;
use onemount_core::domain::upload_session::UploadPriority;
use onemount_core::domain::{DriveItem, FileStatus, Inode, ItemId, JournalOp, RemoteError};
use onemount_core::ports::IRemoteClient;
use onemount_fs::status::unique_conflict_copy_name;
use onemount_fs::{InodeTree, OnlineState, StatusEngine, UploadManager};
use onemount_store::MetadataStore;

/// Store key of the cached drive quota record (shared with statfs).
const QUOTA_CONFIG_KEY: &str = "drive_quota";

/// Store key of the persisted offline flag (read by the stats report).
const OFFLINE_CONFIG_KEY: &str = "offline";

/// Summary of one delta invocation.
#[derive(Debug, Default, Clone)]
pub struct DeltaOutcome {
    /// Items upserted into the tree
    pub upserts: u64,
    /// Items removed
    pub deletions: u64,
    /// Conflicts detected and materialized
    pub conflicts: u64,
    /// Journal entries replayed after reconnect
    pub replayed: u64,
}

/// The delta synchronization engine.
pub struct SyncEngine {
    remote: Arc<dyn IRemoteClient>,
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    tree: Arc<InodeTree>,
    uploads: Arc<UploadManager>,
    statuses: Arc<StatusEngine>,
    online: Arc<OnlineState>,
    /// The loop must not overlap with itself; push-triggered runs wait here.
    gate: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn IRemoteClient>,
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        tree: Arc<InodeTree>,
        uploads: Arc<UploadManager>,
        statuses: Arc<StatusEngine>,
        online: Arc<OnlineState>,
    ) -> Self {
        Self {
            remote,
            store,
            cache,
            tree,
            uploads,
            statuses,
            online,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs one delta invocation. Serialized: a concurrent caller waits for
    /// the in-flight invocation instead of overlapping it.
    pub async fn run_once(&self) -> Result<DeltaOutcome, RemoteError> {
        let _serialized = self.gate.lock().await;

        let cursor = self
            .store
            .get_cursor()
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?;

        let batch = match self.remote.delta(cursor.as_ref()).await {
            Ok(batch) => batch,
            Err(err) => {
                if err.is_connectivity() {
                    self.online.set_online(false);
                    let _ = self.store.set_config(OFFLINE_CONFIG_KEY, b"1").await;
                }
                return Err(err);
            }
        };

        // the first successful delta call marks the filesystem online
        let reconnected = self.online.set_online(true);
        let _ = self.store.set_config(OFFLINE_CONFIG_KEY, b"0").await;

        let mut outcome = DeltaOutcome::default();
        for item in batch.items {
            self.apply_item(item, &mut outcome).await;
        }

        // cursor advances only after the whole batch has been applied
        self.store
            .set_cursor(&batch.cursor)
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?;

        if reconnected {
            outcome.replayed = self.replay_journal().await?;
        }

        self.refresh_quota().await;

        debug!(
            upserts = outcome.upserts,
            deletions = outcome.deletions,
            conflicts = outcome.conflicts,
            replayed = outcome.replayed,
            "delta invocation complete"
        );
        Ok(outcome)
    }

    /// Applies one delta item to the tree and store.
    async fn apply_item(&self, item: DriveItem, outcome: &mut DeltaOutcome) {
        if item.id.is_root() || item.parent_id().is_none() && !item.is_deleted() {
            // the root item itself carries nothing to reconcile
            return;
        }

        if item.is_deleted() {
            self.apply_deletion(&item.id, outcome).await;
            return;
        }

        self.ensure_parent(&item).await;

        let existing = self.tree.get(&item.id);
        match existing {
            None => {
                let inode = Inode::new(item);
                let node = self.tree.insert(inode);
                let snapshot = node.snapshot();
                if let Err(e) = self.store.put_inode(&snapshot).await {
                    warn!(error = %e, "failed to persist delta upsert");
                }
                outcome.upserts += 1;
            }
            Some(node) => {
                let (dirty, local_etag, name, parent_id) = node.with(|i| {
                    (
                        i.dirty,
                        i.item.e_tag.clone(),
                        i.name().to_string(),
                        i.parent_id().cloned(),
                    )
                });
                let pending_upload = matches!(
                    self.store.get_upload(&item.id).await,
                    Ok(Some(session)) if !session.state.is_terminal()
                );
                let etag_advanced = item.e_tag.is_some() && item.e_tag != local_etag;

                if (dirty || pending_upload) && etag_advanced {
                    outcome.conflicts += 1;
                    self.materialize_conflict(&node, item).await;
                    return;
                }

                // idempotent upsert: same ETag means nothing to do beyond
                // keeping parent links consistent
                let moved = item.parent_id().cloned() != parent_id
                    || item.name != name;
                if moved {
                    if let (Some(new_parent), new_name) = (item.parent_id().cloned(), &item.name) {
                        let _ = self.tree.relink(&item.id, &new_parent, new_name);
                    }
                }
                if etag_advanced {
                    node.with_mut(|i| {
                        let enumerated = i.children_enumerated;
                        let children = std::mem::take(&mut i.children);
                        i.item = item.clone();
                        i.children = children;
                        i.children_enumerated = enumerated;
                    });
                    // remote content changed under a clean local copy
                    if self.cache.has(&item.id) {
                        let matches = self
                            .cache
                            .hash(&item.id)
                            .await
                            .ok()
                            .as_deref()
                            .map(|local| Some(local) == item.quick_xor_hash())
                            .unwrap_or(false);
                        if !matches {
                            let _ = self.cache.delete(&item.id).await;
                            self.statuses.transition(&item.id, FileStatus::Cloud).await;
                        }
                    }
                    outcome.upserts += 1;
                }
                let snapshot = node.snapshot();
                if let Err(e) = self.store.put_inode(&snapshot).await {
                    warn!(error = %e, "failed to persist delta update");
                }
            }
        }
    }

    /// Removes a delta-deleted item, unless local edits still reference it.
    async fn apply_deletion(&self, id: &ItemId, outcome: &mut DeltaOutcome) {
        let Some(node) = self.tree.get(id) else {
            return; // already gone; deletions are idempotent
        };
        if node.with(|i| i.dirty) {
            // the local edit survives; the next flush re-creates it remotely
            debug!(id = %id, "delta deletion skipped for dirty local copy");
            return;
        }
        self.tree.remove(id);
        let _ = self.cache.delete(id).await;
        if let Err(e) = self.store.delete_inode(id).await {
            warn!(id = %id, error = %e, "failed to persist delta deletion");
        }
        outcome.deletions += 1;
    }

    /// Creates missing parents for a delta item, fetching them by id.
    async fn ensure_parent(&self, item: &DriveItem) {
        let mut missing: Vec<DriveItem> = Vec::new();
        let mut current = item.parent_id().cloned();

        // walk up until a known ancestor; delta batches are not ordered
        // parent-first
        for _ in 0..64 {
            let Some(parent_id) = current else { break };
            if parent_id.is_root() || self.tree.get(&parent_id).is_some() {
                break;
            }
            match self.remote.get_item(&parent_id).await {
                Ok(parent) => {
                    current = parent.parent_id().cloned();
                    missing.push(parent);
                }
                Err(e) => {
                    warn!(parent = %parent_id, error = %e, "failed to fetch missing parent");
                    break;
                }
            }
        }

        for parent in missing.into_iter().rev() {
            let node = self.tree.insert(Inode::new(parent));
            let snapshot = node.snapshot();
            let _ = self.store.put_inode(&snapshot).await;
        }
    }

    /// The conflict policy: keep the local copy in place, fetch the remote
    /// version as a `(Conflict Copy <timestamp>)` sibling, and mark the
    /// original `conflict` until the user deletes one of the two.
    async fn materialize_conflict(&self, original: &Arc<onemount_fs::TreeNode>, remote_item: DriveItem) {
        let original_id = original.with(|i| i.id().clone());
        let parent_id = original
            .with(|i| i.parent_id().cloned())
            .unwrap_or_else(ItemId::root);
        let name = original.with(|i| i.name().to_string());

        let copy_name = unique_conflict_copy_name(&name, Utc::now(), |candidate| {
            self.tree.lookup_child(&parent_id, candidate).is_some()
        });

        // the copy is a fresh local item carrying the remote version's bytes
        let copy_id = ItemId::local();
        let mut copy_item = DriveItem::new_file(copy_id.clone(), &copy_name, parent_id.clone());
        copy_item.size = remote_item.size;
        let copy_node = self.tree.insert(Inode::new(copy_item));

        let fetched = match self.cache.writer(&copy_id).await {
            Ok(mut writer) => match self.remote.download(&original_id, &mut writer).await {
                Ok(_) => writer
                    .promote(remote_item.quick_xor_hash())
                    .await
                    .map(|_| ()),
                Err(e) => {
                    let _ = writer.abandon().await;
                    Err(onemount_cache::CacheError::NotCached(e.to_string()))
                }
            },
            Err(e) => Err(e),
        };
        if let Err(e) = fetched {
            warn!(id = %original_id, error = %e, "conflict copy fetch failed");
            self.tree.remove(&copy_id);
            // leave the original out-of-sync; the next delta retries
            self.statuses
                .transition(&original_id, FileStatus::OutOfSync)
                .await;
            return;
        }

        // the original's base advances to the remote ETag so its eventual
        // re-upload carries the right precondition
        original.with_mut(|i| {
            i.item.e_tag = remote_item.e_tag.clone();
            i.dirty = true;
        });
        self.tree.link_conflict(&original_id, &copy_id);
        self.statuses
            .transition(&copy_id, FileStatus::LocalModified)
            .await;

        // out-of-sync is the transient step into conflict
        self.statuses
            .transition(&original_id, FileStatus::OutOfSync)
            .await;
        self.statuses
            .transition(&original_id, FileStatus::Conflict)
            .await;

        let originals = original.snapshot();
        let copies = copy_node.snapshot();
        if let Err(e) = self.store.apply_inode_batch(&[originals, copies], &[]).await {
            warn!(error = %e, "failed to persist conflict materialization");
        }
        info!(original = %original_id, copy = %copy_name, "conflict copy materialized");
    }

    /// Replays the offline journal strictly in append order, translating
    /// each entry into upload submissions or deletions. Entries are trimmed
    /// as they replay; a connectivity failure stops the replay and leaves
    /// the remainder for the next reconnect.
    pub async fn replay_journal(&self) -> Result<u64, RemoteError> {
        let entries = self
            .store
            .journal_entries()
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?;
        if entries.is_empty() {
            return Ok(0);
        }
        info!(entries = entries.len(), "replaying offline journal");

        let mut replayed = 0u64;
        for (seq, entry) in entries {
            let result = self.replay_entry(&entry.id, &entry.op).await;
            match result {
                Ok(()) => {
                    self.store
                        .trim_journal(seq)
                        .await
                        .map_err(|e| RemoteError::Internal(e.to_string()))?;
                    replayed += 1;
                }
                Err(err) if err.is_connectivity() => {
                    self.online.set_online(false);
                    warn!(seq, error = %err, "journal replay interrupted, will resume");
                    return Ok(replayed);
                }
                Err(err) => {
                    // a poisoned entry must not wedge the journal
                    warn!(seq, id = %entry.id, error = %err, "journal entry failed, skipping");
                    self.store
                        .trim_journal(seq)
                        .await
                        .map_err(|e| RemoteError::Internal(e.to_string()))?;
                    self.statuses.record_error(&entry.id, &err).await;
                }
            }
        }
        Ok(replayed)
    }

    async fn replay_entry(&self, id: &ItemId, op: &JournalOp) -> Result<(), RemoteError> {
        match op {
            JournalOp::Create { parent_id, name, is_dir } => {
                if *is_dir {
                    // folders are created synchronously; files go through
                    // the upload manager like any other content
                    let parent = self
                        .tree
                        .get(id)
                        .and_then(|n| n.with(|i| i.parent_id().cloned()))
                        .unwrap_or_else(|| parent_id.clone());
                    if parent.is_local() {
                        return Err(RemoteError::Internal(format!(
                            "parent of offline folder {name} was never created"
                        )));
                    }
                    let created = self.remote.create_folder(&parent, name, "rename").await?;
                    if self.tree.get(id).is_some() {
                        let node = self.tree.adopt_remote_id(id, created)?;
                        let snapshot = node.snapshot();
                        self.store
                            .adopt_inode_id(id, &snapshot)
                            .await
                            .map_err(|e| RemoteError::Internal(e.to_string()))?;
                    }
                    Ok(())
                } else {
                    if self.tree.get(id).is_none() {
                        return Ok(()); // created then deleted offline
                    }
                    self.uploads.enqueue(id, UploadPriority::Low).await
                }
            }
            JournalOp::Modify => {
                if self.tree.get(id).is_none() {
                    return Ok(());
                }
                self.uploads.enqueue(id, UploadPriority::Low).await
            }
            JournalOp::Delete => {
                if !id.is_local() {
                    self.uploads.enqueue_deletion(id).await;
                }
                // the tombstoned inode is retired now that the deletion is
                // on its way upstream
                if let Some(node) = self.tree.get(id) {
                    if node.with(|i| i.tombstone) {
                        self.tree.remove(id);
                        let _ = self.cache.delete(id).await;
                        let _ = self.store.delete_inode(id).await;
                    }
                }
                Ok(())
            }
            JournalOp::Rename { new_parent_id, new_name } => {
                if id.is_local() {
                    return Ok(()); // folded into the pending create
                }
                let item = self
                    .remote
                    .rename_move(id, new_parent_id, new_name)
                    .await?;
                if let Some(node) = self.tree.get(id) {
                    node.with_mut(|i| i.item.e_tag = item.e_tag.clone());
                }
                Ok(())
            }
        }
    }

    async fn refresh_quota(&self) {
        if let Ok(quota) = self.remote.get_drive_quota().await {
            if let Ok(raw) = serde_json::to_vec(&quota) {
                let _ = self.store.set_config(QUOTA_CONFIG_KEY, &raw).await;
            }
        }
    }

    /// Breadth-first walk of the full remote tree, populating metadata.
    /// Used by `--sync-tree`; content stays in the cloud.
    pub async fn walk_tree(&self) -> Result<u64, RemoteError> {
        let mut frontier = vec![ItemId::root()];
        let mut visited = 0u64;

        while let Some(dir) = frontier.pop() {
            let children = match self.remote.list_children(&dir).await {
                Ok(children) => children,
                Err(err) if err.is_connectivity() => {
                    self.online.set_online(false);
                    return Err(err);
                }
                Err(err) => {
                    warn!(dir = %dir, error = %err, "tree walk skipping unlistable directory");
                    continue;
                }
            };

            let mut upserts = Vec::new();
            for item in children {
                if item.is_deleted() {
                    continue;
                }
                if item.is_dir() {
                    frontier.push(item.id.clone());
                }
                if self.tree.get(&item.id).is_none() {
                    let node = self.tree.insert(Inode::new(item));
                    upserts.push(node.snapshot());
                }
                visited += 1;
            }
            if let Some(node) = self.tree.get(&dir) {
                node.with_mut(|i| i.children_enumerated = true);
                upserts.push(node.snapshot());
            }
            if let Err(e) = self.store.apply_inode_batch(&upserts, &[]).await {
                warn!(error = %e, "tree walk persistence failed");
            }
        }

        info!(visited, "background tree walk complete");
        Ok(visited)
    }
}
