//! FUSE filesystem implementation.
//!
//! Implements `fuser::Filesystem` for OneMount, routing the kernel's VFS
//! callbacks through the inode tree, the content cache, and the transfer
//! managers. FUSE callbacks are synchronous; async work is bridged through
//! a `tokio::runtime::Handle` with `block_on`.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Utc;
use dashmap::DashMap;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use onemount_cache::ContentCache;
use onemount_core::domain::upload_session::UploadPriority;
use onemount_core::domain::{
    DriveItem, FileStatus, Inode, ItemId, JournalEntry, JournalOp, RemoteError,
};
use onemount_core::ports::{DriveQuota, IRemoteClient};
use onemount_store::MetadataStore;

use crate::download::DownloadManager;
use crate::error::{errno_for_remote, ErrnoContext, FsError};
use crate::online::OnlineState;
use crate::status::StatusEngine;
use crate::tree::{InodeTree, TreeNode};
use crate::upload::UploadManager;
use crate::xattr;

/// TTL for kernel attribute caching. Short, so remote changes surface
/// quickly without hammering the daemon.
const TTL: Duration = Duration::from_secs(1);

/// FUSE open flag telling the kernel cached pages are still valid.
const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// POSIX NAME_MAX.
const NAME_MAX: usize = 255;

/// Store key of the cached drive quota record.
const QUOTA_CONFIG_KEY: &str = "drive_quota";

/// Preferred I/O block size reported to the kernel.
const BLOCK_SIZE: u32 = 4096;

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct FsConfig {
    /// Bound on fsync's best-effort wait for upload completion
    pub fsync_timeout: Duration,
    /// Bound on open()'s fetch-then-open download wait
    pub download_timeout: Duration,
    /// Serve extended attributes (disable for restricted mounts)
    pub enable_xattrs: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            fsync_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(300),
            enable_xattrs: true,
        }
    }
}

/// One open file handle.
struct OpenFile {
    id: ItemId,
    write: bool,
}

/// One entry of a directory-handle snapshot.
struct DirEntrySnap {
    node_id: u64,
    name: String,
    kind: FileType,
}

/// The OneMount filesystem engine.
pub struct OneMountFs {
    rt: Handle,
    tree: Arc<InodeTree>,
    cache: Arc<ContentCache>,
    store: Arc<MetadataStore>,
    remote: Arc<dyn IRemoteClient>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    statuses: Arc<StatusEngine>,
    online: Arc<OnlineState>,
    config: FsConfig,
    next_fh: AtomicU64,
    open_files: DashMap<u64, OpenFile>,
    open_dirs: DashMap<u64, Vec<DirEntrySnap>>,
    open_counts: Arc<DashMap<String, usize>>,
    uid: u32,
    gid: u32,
}

impl OneMountFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rt: Handle,
        tree: Arc<InodeTree>,
        cache: Arc<ContentCache>,
        store: Arc<MetadataStore>,
        remote: Arc<dyn IRemoteClient>,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        statuses: Arc<StatusEngine>,
        online: Arc<OnlineState>,
        config: FsConfig,
    ) -> Self {
        // safe wrappers over the always-successful libc id getters
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        Self {
            rt,
            tree,
            cache,
            store,
            remote,
            downloads,
            uploads,
            statuses,
            online,
            config,
            next_fh: AtomicU64::new(1),
            open_files: DashMap::new(),
            open_dirs: DashMap::new(),
            open_counts: Arc::new(DashMap::new()),
            uid,
            gid,
        }
    }

    /// The open-handle counts, consulted by the eviction gate.
    pub fn open_counts(&self) -> Arc<DashMap<String, usize>> {
        Arc::clone(&self.open_counts)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn node(&self, ino: u64) -> Result<Arc<TreeNode>, libc::c_int> {
        self.tree.get_by_node_id(ino).ok_or(libc::ENOENT)
    }

    /// Synthesizes kernel attributes from an inode.
    ///
    /// st_size is the file marker's size or the local cache length,
    /// whichever is larger while the file is dirty.
    fn attr_of(&self, node: &TreeNode) -> FileAttr {
        let (item, dirty, mode) = node.with(|i| (i.item.clone(), i.dirty, i.mode_bits()));
        let kind = if item.is_dir() {
            FileType::Directory
        } else {
            FileType::RegularFile
        };

        let mut size = item.size;
        if dirty || item.id.is_local() {
            if let Some(cached) = self.cache.size(&item.id) {
                size = size.max(cached);
            }
        }

        let mtime = item
            .last_modified_date_time
            .and_then(|dt| {
                UNIX_EPOCH.checked_add(Duration::new(
                    dt.timestamp().max(0) as u64,
                    dt.timestamp_subsec_nanos(),
                ))
            })
            .unwrap_or(UNIX_EPOCH);

        FileAttr {
            ino: node.node_id,
            size,
            blocks: size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: mode as u16,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Populates a directory's child index from the server when it has not
    /// been enumerated since mount (or since the last delta touching it).
    /// Offline, the cached list serves as-is.
    fn ensure_children(&self, node: &Arc<TreeNode>) -> Result<(), FsError> {
        let (id, enumerated, is_dir) =
            node.with(|i| (i.id().clone(), i.children_enumerated, i.is_dir()));
        if !is_dir {
            return Err(FsError::NotADirectory(id.to_string()));
        }
        if enumerated || !self.online.is_online() || id.is_local() {
            return Ok(());
        }

        let children = self.rt.block_on(self.remote.list_children(&id));
        let children = match children {
            Ok(children) => children,
            Err(err) if err.is_connectivity() => {
                self.online.set_online(false);
                return Ok(()); // fall back to the cached list
            }
            Err(err) => return Err(err.into()),
        };

        let mut upserts = Vec::with_capacity(children.len());
        for item in children {
            if item.is_deleted() {
                continue;
            }
            let existing = self.tree.get(&item.id);
            let inode = match existing {
                Some(node) => {
                    node.with_mut(|i| i.item = item.clone());
                    node.snapshot()
                }
                None => {
                    let inode = Inode::new(item);
                    self.tree.insert(inode.clone());
                    inode
                }
            };
            upserts.push(inode);
        }
        node.with_mut(|i| i.children_enumerated = true);
        upserts.push(node.snapshot());

        self.rt
            .block_on(self.store.apply_inode_batch(&upserts, &[]))?;
        Ok(())
    }

    /// Fetch-then-open materialization for content reads and writes.
    fn ensure_content(&self, id: &ItemId, truncate: bool) -> Result<(), FsError> {
        if truncate {
            self.rt.block_on(self.cache.truncate(id, 0))?;
            return Ok(());
        }
        if self.cache.has(id) {
            self.cache.touch(id);
            return Ok(());
        }

        // an empty never-uploaded file has nothing to fetch
        let size = self.tree.get(id).map(|n| n.with(|i| i.item.size)).unwrap_or(0);
        if size == 0 || id.is_local() {
            self.rt.block_on(self.cache.truncate(id, 0))?;
            return Ok(());
        }

        // request() spawns its worker, so it must run inside the runtime
        let downloads = Arc::clone(&self.downloads);
        let timeout = self.config.download_timeout;
        self.rt.block_on(async move {
            let rx = downloads.request(id);
            DownloadManager::wait_signal(rx, timeout).await
        })?;
        Ok(())
    }

    /// Marks cached content modified: dirty bit, size/mtime refresh,
    /// `local-modified` status.
    fn mark_modified(&self, node: &Arc<TreeNode>, new_len: Option<u64>) {
        let id = node.with(|i| i.id().clone());
        node.with_mut(|i| {
            i.dirty = true;
            i.item.last_modified_date_time = Some(Utc::now());
            if let Some(len) = new_len {
                i.item.size = i.item.size.max(len);
            }
        });
        self.rt
            .block_on(self.statuses.transition(&id, FileStatus::LocalModified));
    }

    /// Queues the dirty content: an upload when online, a journal entry
    /// when offline.
    fn queue_dirty(&self, node: &Arc<TreeNode>, priority: UploadPriority) -> Result<(), FsError> {
        let (id, dirty) = node.with(|i| (i.id().clone(), i.dirty));
        if !dirty {
            return Ok(());
        }

        if self.online.is_online() {
            self.rt.block_on(self.uploads.enqueue(&id, priority))?;
        } else {
            let entry = JournalEntry::new(id.clone(), JournalOp::Modify);
            self.rt.block_on(self.store.append_journal(&entry))?;
            // the dirty bit clears on enqueue; journaled changes enqueue at
            // replay, so the bit stays set until then
            debug!(id = %id, "offline modification journaled");
        }
        let snapshot = node.snapshot();
        self.rt.block_on(self.store.put_inode(&snapshot))?;
        Ok(())
    }

    /// Deletes an item: server-side first when online, tombstone + journal
    /// entry when offline. Local-only items never touch the server.
    fn delete_item(&self, node: &Arc<TreeNode>) -> Result<(), FsError> {
        let id = node.with(|i| i.id().clone());

        if id.is_local() {
            // never uploaded: retire the pending session and vanish locally
            self.rt.block_on(self.store.delete_upload(&id))?;
        } else if self.online.is_online() {
            match self.rt.block_on(self.remote.delete(&id)) {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(err) if err.is_connectivity() => {
                    self.online.set_online(false);
                    return self.tombstone(node, &id);
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            return self.tombstone(node, &id);
        }

        self.tree.remove(&id);
        self.rt.block_on(async {
            let _ = self.cache.delete(&id).await;
            self.store.delete_inode(&id).await
        })?;
        self.resolve_conflict_on_delete(&id);
        Ok(())
    }

    /// Deleting one side of a conflict pair resolves it: the survivor drops
    /// out of `conflict`, back to `local-modified` (dirty edits re-queue) or
    /// to `local`/`cloud`.
    fn resolve_conflict_on_delete(&self, deleted: &ItemId) {
        let Some(peer) = self.tree.take_conflict_peer(deleted) else {
            return;
        };
        let Some(node) = self.tree.get(&peer) else {
            return;
        };
        let dirty = node.with(|i| i.dirty);
        let status = if dirty || self.cache.has(&peer) && peer.is_local() {
            FileStatus::LocalModified
        } else if self.cache.has(&peer) {
            FileStatus::Local
        } else {
            FileStatus::Cloud
        };
        // the transition persists the survivor and publishes the change
        self.rt
            .block_on(self.statuses.transition(&peer, status.clone()));

        if matches!(status, FileStatus::LocalModified) && self.online.is_online() {
            let _ = self
                .rt
                .block_on(self.uploads.enqueue(&peer, UploadPriority::High));
        }
        info!(survivor = %peer, "conflict resolved by deletion");
    }

    fn tombstone(&self, node: &Arc<TreeNode>, id: &ItemId) -> Result<(), FsError> {
        node.with_mut(|i| i.tombstone = true);
        let entry = JournalEntry::new(id.clone(), JournalOp::Delete);
        let snapshot = node.snapshot();
        self.rt.block_on(async {
            self.store.append_journal(&entry).await?;
            self.store.put_inode(&snapshot).await
        })?;
        debug!(id = %id, "offline delete tombstoned");
        Ok(())
    }

    fn name_ok(name: &OsStr) -> Result<&str, libc::c_int> {
        let name = name.to_str().ok_or(libc::ENOENT)?;
        if name.len() > NAME_MAX {
            return Err(libc::ENAMETOOLONG);
        }
        Ok(name)
    }

    /// Cached drive quota for statfs; refreshed opportunistically.
    fn cached_quota(&self) -> DriveQuota {
        self.rt
            .block_on(self.store.get_config(QUOTA_CONFIG_KEY))
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    fn spawn_quota_refresh(&self) {
        if !self.online.is_online() {
            return;
        }
        let remote = Arc::clone(&self.remote);
        let store = Arc::clone(&self.store);
        self.rt.spawn(async move {
            if let Ok(quota) = remote.get_drive_quota().await {
                if let Ok(raw) = serde_json::to_vec(&quota) {
                    let _ = store.set_config(QUOTA_CONFIG_KEY, &raw).await;
                }
            }
        });
    }
}

impl Filesystem for OneMountFs {
    /// Loads the persisted tree, applies crash recovery, and rehydrates
    /// pending upload sessions.
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        info!("initializing OneMount filesystem");

        let inodes = self
            .rt
            .block_on(self.store.iter_inodes())
            .map_err(|e| {
                warn!(error = %e, "failed to load inodes from store");
                libc::EIO
            })?;

        let mut recovered = Vec::new();
        for mut inode in inodes {
            match inode.status {
                // a crashed download leaves no usable state
                FileStatus::Downloading => {
                    let id = inode.id().clone();
                    self.rt.block_on(async {
                        let _ = self.cache.discard_partial(&id).await;
                    });
                    inode.status = if self.cache.has(&id) {
                        FileStatus::Local
                    } else {
                        FileStatus::Cloud
                    };
                    recovered.push(inode.clone());
                }
                // a crashed upload resumes from its persisted session
                FileStatus::Syncing => {
                    inode.status = FileStatus::LocalModified;
                    recovered.push(inode.clone());
                }
                _ => {}
            }
            let status = inode.status.clone();
            let id = inode.id().clone();
            self.tree.insert(inode);
            self.tree.set_status(&id, status);
        }
        if !recovered.is_empty() {
            info!(count = recovered.len(), "crash recovery applied");
            if let Err(e) = self.rt.block_on(self.store.apply_inode_batch(&recovered, &[])) {
                warn!(error = %e, "failed to persist crash recovery");
            }
        }

        // rebuild child indexes order-independently: a child loaded before
        // its parent could not link itself at insert time
        for id in self.tree.ids() {
            if let Some(node) = self.tree.get(&id) {
                if let Some(parent_id) = node.with(|i| i.parent_id().cloned()) {
                    if let Some(parent) = self.tree.get(&parent_id) {
                        parent.with_mut(|p| p.link_child(id.clone()));
                    }
                }
            }
        }

        if let Err(e) = self.rt.block_on(self.uploads.rehydrate()) {
            warn!(error = %e, "upload rehydration failed");
        }

        self.spawn_quota_refresh();
        info!(items = self.tree.len(), "filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(items = self.tree.len(), "filesystem shutting down");
    }

    /// Resolves a name within a directory, falling back to a remote child
    /// lookup for names the tree has not seen yet.
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match Self::name_ok(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = parent_node.with(|i| i.id().clone());

        if let Some(child) = self.tree.lookup_child(&parent_id, name) {
            return reply.entry(&TTL, &self.attr_of(&child), 0);
        }

        // unknown locally: ask the service, unless offline or the parent
        // itself has never been uploaded
        if !self.online.is_online() || parent_id.is_local() {
            return reply.error(libc::ENOENT);
        }
        match self.rt.block_on(self.remote.get_child(&parent_id, name)) {
            Ok(item) if !item.is_deleted() => {
                let node = self.tree.insert(Inode::new(item));
                let snapshot = node.snapshot();
                let _ = self.rt.block_on(self.store.put_inode(&snapshot));
                reply.entry(&TTL, &self.attr_of(&node), 0);
            }
            Ok(_) => reply.error(libc::ENOENT),
            Err(RemoteError::NotFound(_)) => reply.error(libc::ENOENT),
            Err(err) => {
                if err.is_connectivity() {
                    self.online.set_online(false);
                    return reply.error(libc::ENOENT);
                }
                reply.error(errno_for_remote(&err, ErrnoContext::Metadata))
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.node(ino) {
            Ok(node) => reply.attr(&TTL, &self.attr_of(&node)),
            Err(errno) => reply.error(errno),
        }
    }

    /// Mode changes are stored locally; size changes truncate the cached
    /// blob; times update locally and are not pushed to the server.
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let id = node.with(|i| i.id().clone());

        if let Some(mode) = mode {
            node.with_mut(|i| i.mode = Some(mode & 0o777));
        }

        if let Some(size) = size {
            if node.with(|i| i.is_dir()) {
                return reply.error(libc::EISDIR);
            }
            if let Err(e) = self.ensure_content(&id, size == 0) {
                return reply.error(e.into());
            }
            if let Err(e) = self.rt.block_on(self.cache.truncate(&id, size)) {
                return reply.error(FsError::from(e).into());
            }
            node.with_mut(|i| i.item.size = size);
            self.mark_modified(&node, Some(size));
        }

        if let Some(mtime) = mtime {
            let when = match mtime {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => SystemTime::now(),
            };
            node.with_mut(|i| {
                i.item.last_modified_date_time = Some(chrono::DateTime::<Utc>::from(when));
            });
        }

        let snapshot = node.snapshot();
        let _ = self.rt.block_on(self.store.put_inode(&snapshot));
        reply.attr(&TTL, &self.attr_of(&node));
    }

    /// Captures a stable snapshot of the directory for this handle.
    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        if let Err(e) = self.ensure_children(&node) {
            return reply.error(e.into());
        }

        let dir_id = node.with(|i| i.id().clone());
        let mut snapshot = Vec::new();
        for (child_id, name, is_dir) in self.tree.children_of(&dir_id) {
            if let Some(child) = self.tree.get(&child_id) {
                snapshot.push(DirEntrySnap {
                    node_id: child.node_id,
                    name,
                    kind: if is_dir {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    },
                });
            }
        }

        let fh = self.alloc_fh();
        self.open_dirs.insert(fh, snapshot);
        reply.opened(fh, FOPEN_KEEP_CACHE);
    }

    /// Serves the snapshot captured at opendir; consistent for the handle's
    /// lifetime even if a delta lands mid-iteration.
    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(snapshot) = self.open_dirs.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let parent_ino = self
            .node(ino)
            .ok()
            .and_then(|n| {
                n.with(|i| i.parent_id().cloned())
                    .and_then(|pid| self.tree.get(&pid))
            })
            .map(|p| p.node_id)
            .unwrap_or(ino);

        let mut entries: Vec<(u64, FileType, &str)> = vec![
            (ino, FileType::Directory, "."),
            (parent_ino, FileType::Directory, ".."),
        ];
        for entry in snapshot.iter() {
            entries.push((entry.node_id, entry.kind, entry.name.as_str()));
        }

        for (i, (node_id, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(node_id, (i + 1) as i64, kind, name) {
                break; // buffer full
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        self.open_dirs.remove(&fh);
        reply.ok();
    }

    /// Fetch-then-open: write opens materialize or truncate the blob first;
    /// read opens of uncached content block on the download manager.
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        if node.with(|i| i.is_dir()) {
            return reply.error(libc::EISDIR);
        }
        let id = node.with(|i| i.id().clone());

        let write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let truncate = flags & libc::O_TRUNC != 0;

        if let Err(e) = self.ensure_content(&id, write && truncate) {
            // offline reads of uncached content have nothing to serve
            return reply.error(e.into());
        }
        if truncate {
            self.mark_modified(&node, Some(0));
            node.with_mut(|i| i.item.size = 0);
        }

        *self.open_counts.entry(id.as_str().to_string()).or_insert(0) += 1;
        let fh = self.alloc_fh();
        self.open_files.insert(fh, OpenFile { id, write });
        reply.opened(fh, FOPEN_KEEP_CACHE);
    }

    /// Serves from cache, blocking while the requested content is still
    /// downloading.
    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(open) = self.open_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        let id = open.id.clone();
        drop(open);

        if self.downloads.is_inflight(&id) {
            if let Err(err) = self
                .rt
                .block_on(self.downloads.wait(&id, self.config.download_timeout))
            {
                return reply.error(errno_for_remote(&err, ErrnoContext::Content));
            }
        }

        match self.rt.block_on(self.cache.read_at(&id, offset as u64, size)) {
            Ok(data) => {
                self.cache.touch(&id);
                reply.data(&data);
            }
            Err(e) => reply.error(FsError::from(e).into()),
        }
    }

    /// Updates the cached blob and marks the file modified.
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(open) = self.open_files.get(&fh) else {
            return reply.error(libc::EBADF);
        };
        if !open.write {
            return reply.error(libc::EBADF);
        }
        let id = open.id.clone();
        drop(open);

        let written = match self.rt.block_on(self.cache.write_at(&id, offset as u64, data)) {
            Ok(written) => written,
            Err(e) => return reply.error(FsError::from(e).into()),
        };

        if let Ok(node) = self.node(ino) {
            self.mark_modified(&node, Some(offset as u64 + written as u64));
        }
        reply.written(written);
    }

    /// Dirty content is queued on flush; the dirty bit clears on enqueue.
    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        match self.queue_dirty(&node, UploadPriority::High) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some((_, open)) = self.open_files.remove(&fh) {
            if let Some(mut count) = self.open_counts.get_mut(open.id.as_str()) {
                *count = count.saturating_sub(1);
            }
        }
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(_) => return reply.ok(),
        };
        match self.queue_dirty(&node, UploadPriority::High) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    /// Persists local state, then waits (bounded) for upload completion.
    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        if let Err(e) = self.queue_dirty(&node, UploadPriority::High) {
            return reply.error(e.into());
        }
        let snapshot = node.snapshot();
        if let Err(e) = self.rt.block_on(self.store.put_inode(&snapshot)) {
            return reply.error(FsError::from(e).into());
        }

        // best-effort wait; a still-running upload is not an fsync failure
        let id = node.with(|i| i.id().clone());
        if let Err(err) = self
            .rt
            .block_on(self.uploads.wait_idle(&id, self.config.fsync_timeout))
        {
            debug!(id = %id, error = %err, "fsync returning before upload completion");
        }
        reply.ok();
    }

    /// Allocates a local-id inode and queues its creation upload.
    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match Self::name_ok(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = parent_node.with(|i| i.id().clone());

        if self.tree.lookup_child(&parent_id, name).is_some() {
            return reply.error(libc::EEXIST);
        }

        let id = ItemId::local();
        let mut inode = Inode::new(DriveItem::new_file(id.clone(), name, parent_id.clone()));
        inode.mode = Some(mode & 0o777);
        inode.dirty = true;
        let node = self.tree.insert(inode);

        if let Err(e) = self.rt.block_on(self.cache.truncate(&id, 0)) {
            self.tree.remove(&id);
            return reply.error(FsError::from(e).into());
        }
        self.rt
            .block_on(self.statuses.transition(&id, FileStatus::LocalModified));

        let queued = if self.online.is_online() {
            self.rt
                .block_on(self.uploads.enqueue(&id, UploadPriority::High))
                .map_err(FsError::from)
        } else {
            let entry = JournalEntry::new(
                id.clone(),
                JournalOp::Create {
                    parent_id: parent_id.clone(),
                    name: name.to_string(),
                    is_dir: false,
                },
            );
            self.rt
                .block_on(self.store.append_journal(&entry))
                .map(|_| ())
                .map_err(FsError::from)
        };
        if let Err(e) = queued {
            warn!(id = %id, error = %e, "creation upload submission failed");
        }

        let snapshot = node.snapshot();
        let _ = self.rt.block_on(self.store.put_inode(&snapshot));

        *self.open_counts.entry(id.as_str().to_string()).or_insert(0) += 1;
        let write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;
        let fh = self.alloc_fh();
        self.open_files.insert(fh, OpenFile { id, write });
        reply.created(&TTL, &self.attr_of(&node), 0, fh, 0);
    }

    /// Online mkdir creates the folder server-side synchronously; offline
    /// mkdir creates a local inode and journals the create.
    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match Self::name_ok(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = parent_node.with(|i| i.id().clone());

        if self.tree.lookup_child(&parent_id, name).is_some() {
            return reply.error(libc::EEXIST);
        }

        if self.online.is_online() && !parent_id.is_local() {
            match self
                .rt
                .block_on(self.remote.create_folder(&parent_id, name, "fail"))
            {
                Ok(item) => {
                    let mut inode = Inode::new(item);
                    inode.mode = Some(mode & 0o777);
                    inode.children_enumerated = true; // brand new, no children
                    let node = self.tree.insert(inode);
                    let snapshot = node.snapshot();
                    let _ = self.rt.block_on(self.store.put_inode(&snapshot));
                    reply.entry(&TTL, &self.attr_of(&node), 0);
                }
                Err(err) if err.is_connectivity() => {
                    self.online.set_online(false);
                    self.mkdir_offline(&parent_id, name, mode, reply);
                }
                Err(err) => reply.error(errno_for_remote(&err, ErrnoContext::Metadata)),
            }
        } else {
            self.mkdir_offline(&parent_id, name, mode, reply);
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::name_ok(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = parent_node.with(|i| i.id().clone());

        let Some(target) = self.tree.lookup_child(&parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        if !target.with(|i| i.is_dir()) {
            return reply.error(libc::ENOTDIR);
        }
        if let Err(e) = self.ensure_children(&target) {
            return reply.error(e.into());
        }
        let dir_id = target.with(|i| i.id().clone());
        if !self.tree.children_of(&dir_id).is_empty() {
            return reply.error(libc::ENOTEMPTY);
        }

        match self.delete_item(&target) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = match Self::name_ok(name) {
            Ok(name) => name,
            Err(errno) => return reply.error(errno),
        };
        let parent_node = match self.node(parent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let parent_id = parent_node.with(|i| i.id().clone());

        let Some(target) = self.tree.lookup_child(&parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        if target.with(|i| i.is_dir()) {
            return reply.error(libc::EISDIR);
        }

        match self.delete_item(&target) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.into()),
        }
    }

    /// Rename/move. An existing file target is replaced; online renames go
    /// through the service, offline renames update parent links and journal.
    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (name, newname) = match (Self::name_ok(name), Self::name_ok(newname)) {
            (Ok(a), Ok(b)) => (a, b),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        let old_parent = match self.node(parent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let new_parent = match self.node(newparent) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let old_parent_id = old_parent.with(|i| i.id().clone());
        let new_parent_id = new_parent.with(|i| i.id().clone());

        let Some(source) = self.tree.lookup_child(&old_parent_id, name) else {
            return reply.error(libc::ENOENT);
        };
        let source_id = source.with(|i| i.id().clone());

        // an existing file target is replaced; a directory target is refused
        if let Some(target) = self.tree.lookup_child(&new_parent_id, newname) {
            let same = target.with(|i| i.id().clone()) == source_id;
            if !same {
                if target.with(|i| i.is_dir()) {
                    return reply.error(libc::EISDIR);
                }
                if let Err(e) = self.delete_item(&target) {
                    return reply.error(e.into());
                }
            }
        }

        if self.online.is_online() && !source_id.is_local() && !new_parent_id.is_local() {
            match self
                .rt
                .block_on(self.remote.rename_move(&source_id, &new_parent_id, newname))
            {
                Ok(item) => {
                    if let Err(e) = self.tree.relink(&source_id, &new_parent_id, newname) {
                        return reply.error(errno_for_remote(&e, ErrnoContext::Metadata));
                    }
                    source.with_mut(|i| {
                        i.item.e_tag = item.e_tag.clone();
                        i.item.last_modified_date_time = item.last_modified_date_time;
                    });
                }
                Err(err) if err.is_connectivity() => {
                    self.online.set_online(false);
                    if let Err(e) = self.rename_offline(&source_id, &new_parent_id, newname) {
                        return reply.error(e.into());
                    }
                }
                Err(err) => return reply.error(errno_for_remote(&err, ErrnoContext::Metadata)),
            }
        } else if let Err(e) = self.rename_offline(&source_id, &new_parent_id, newname) {
            return reply.error(e.into());
        }

        let snapshot = source.snapshot();
        let _ = self.rt.block_on(self.store.put_inode(&snapshot));
        reply.ok();
    }

    /// Aggregates quota info from the cached drive record.
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let quota = self.cached_quota();
        self.spawn_quota_refresh();

        let bsize = u64::from(BLOCK_SIZE);
        let blocks = quota.total.div_ceil(bsize);
        let free = quota.total.saturating_sub(quota.used).div_ceil(bsize);
        let files = self.tree.len() as u64;

        reply.statfs(blocks, free, free, files, 0, BLOCK_SIZE, NAME_MAX as u32, BLOCK_SIZE);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        if !self.config.enable_xattrs {
            return reply.error(libc::ENOTSUP);
        }
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let id = node.with(|i| i.id().clone());
        let info = self.tree.status_of(&id);

        let Some(name) = name.to_str() else {
            return reply.error(libc::ENODATA);
        };
        let Some(value) = xattr::get_xattr(&info, name) else {
            return reply.error(libc::ENODATA);
        };

        if size == 0 {
            reply.size(value.len() as u32);
        } else if (value.len() as u32) <= size {
            reply.data(&value);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        if !self.config.enable_xattrs {
            return reply.error(libc::ENOTSUP);
        }
        let node = match self.node(ino) {
            Ok(node) => node,
            Err(errno) => return reply.error(errno),
        };
        let id = node.with(|i| i.id().clone());
        let info = self.tree.status_of(&id);

        let mut list = Vec::new();
        for name in xattr::list_xattrs(&info) {
            list.extend_from_slice(name.as_bytes());
            list.push(0);
        }

        if size == 0 {
            reply.size(list.len() as u32);
        } else if (list.len() as u32) <= size {
            reply.data(&list);
        } else {
            reply.error(libc::ERANGE);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        // the status namespace is read-only
        reply.error(libc::ENOTSUP);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOTSUP);
    }
}

impl OneMountFs {
    fn mkdir_offline(&self, parent_id: &ItemId, name: &str, mode: u32, reply: ReplyEntry) {
        let id = ItemId::local();
        let mut inode = Inode::new(DriveItem::new_folder(id.clone(), name, parent_id.clone()));
        inode.mode = Some(mode & 0o777);
        inode.children_enumerated = true;
        let node = self.tree.insert(inode);

        let entry = JournalEntry::new(
            id.clone(),
            JournalOp::Create {
                parent_id: parent_id.clone(),
                name: name.to_string(),
                is_dir: true,
            },
        );
        let snapshot = node.snapshot();
        let persisted = self.rt.block_on(async {
            self.store.append_journal(&entry).await?;
            self.store.put_inode(&snapshot).await
        });
        match persisted {
            Ok(()) => reply.entry(&TTL, &self.attr_of(&node), 0),
            Err(e) => {
                self.tree.remove(&id);
                reply.error(FsError::from(e).into());
            }
        }
    }

    fn rename_offline(
        &self,
        source_id: &ItemId,
        new_parent_id: &ItemId,
        newname: &str,
    ) -> Result<(), FsError> {
        self.tree.relink(source_id, new_parent_id, newname)?;
        // a never-uploaded item only needs its pending submission retargeted
        if source_id.is_local() {
            if let Ok(Some(mut session)) = self.rt.block_on(self.store.get_upload(source_id)) {
                session.parent_id = new_parent_id.clone();
                session.name = newname.to_string();
                let _ = self.rt.block_on(self.store.put_upload(&session));
            }
            return Ok(());
        }
        let entry = JournalEntry::new(
            source_id.clone(),
            JournalOp::Rename {
                new_parent_id: new_parent_id.clone(),
                new_name: newname.to_string(),
            },
        );
        self.rt.block_on(self.store.append_journal(&entry))?;
        Ok(())
    }
}
