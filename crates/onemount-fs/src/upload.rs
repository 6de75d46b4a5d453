//! Upload manager
//!
//! Delivers local changes to the remote service: a durable queue of upload
//! sessions with at most one concurrent session per id, bounded parallelism
//! across ids, two priority classes, exponential backoff with jitter, and a
//! deletion sub-queue. Every state transition is persisted; non-terminal
//! sessions are rehydrated and resumed on process start, chunked sessions
//! from the exact `next_offset` the server last acknowledged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use onemount_cache::ContentCache;
use onemount_core::domain::upload_session::{
    UploadPriority, UploadSession, UploadState, UploadStrategy, SMALL_UPLOAD_THRESHOLD,
};
use onemount_core::domain::{DriveItem, FileStatus, ItemId, RemoteError};
use onemount_core::ports::{ChunkOutcome, IRemoteClient, UploadTarget};
use onemount_store::MetadataStore;

use crate::online::OnlineState;
use crate::status::StatusEngine;
use crate::tree::InodeTree;

/// Worker pool size.
const UPLOAD_WORKERS: usize = 4;

/// Dispatcher poll interval, for backoff deadlines coming due.
const DISPATCH_TICK: Duration = Duration::from_millis(500);

/// Retry budget for server-side deletions.
const MAX_DELETE_RETRIES: u32 = 5;

/// A queued server-side deletion.
#[derive(Debug, Clone)]
struct PendingDeletion {
    id: ItemId,
    retries: u32,
    not_before: Option<chrono::DateTime<Utc>>,
}

#[derive(Default)]
struct Queues {
    high: VecDeque<ItemId>,
    low: VecDeque<ItemId>,
    deletions: VecDeque<PendingDeletion>,
}

/// The upload manager.
pub struct UploadManager {
    remote: Arc<dyn IRemoteClient>,
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    tree: Arc<InodeTree>,
    statuses: Arc<StatusEngine>,
    online: Arc<OnlineState>,
    queues: Mutex<Queues>,
    active: DashMap<String, ()>,
    completion: Arc<DashMap<String, Arc<Notify>>>,
    wake: Notify,
    workers: Arc<Semaphore>,
    cancel: CancellationToken,
    small_threshold: u64,
    chunk_size: u64,
}

impl UploadManager {
    pub fn new(
        remote: Arc<dyn IRemoteClient>,
        store: Arc<MetadataStore>,
        cache: Arc<ContentCache>,
        tree: Arc<InodeTree>,
        statuses: Arc<StatusEngine>,
        online: Arc<OnlineState>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            store,
            cache,
            tree,
            statuses,
            online,
            queues: Mutex::new(Queues::default()),
            active: DashMap::new(),
            completion: Arc::new(DashMap::new()),
            wake: Notify::new(),
            workers: Arc::new(Semaphore::new(UPLOAD_WORKERS)),
            cancel,
            small_threshold: SMALL_UPLOAD_THRESHOLD,
            chunk_size: onemount_core::domain::upload_session::UPLOAD_CHUNK_SIZE,
        })
    }

    #[cfg(test)]
    fn clone_shallow(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            tree: Arc::clone(&self.tree),
            statuses: Arc::clone(&self.statuses),
            online: Arc::clone(&self.online),
            queues: Mutex::new(Queues::default()),
            active: DashMap::new(),
            completion: Arc::clone(&self.completion),
            wake: Notify::new(),
            workers: Arc::clone(&self.workers),
            cancel: self.cancel.clone(),
            small_threshold: self.small_threshold,
            chunk_size: self.chunk_size,
        }
    }

    // ========================================================================
    // submission
    // ========================================================================

    /// Enqueues (or coalesces into) an upload session for `id`.
    ///
    /// At most one session exists per id: a second enqueue while one is
    /// pending raises its priority and refreshes the content length instead
    /// of creating a duplicate.
    pub async fn enqueue(&self, id: &ItemId, priority: UploadPriority) -> Result<(), RemoteError> {
        let node = self
            .tree
            .get(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let (parent_id, name, base_etag) = node.with(|i| {
            (
                i.parent_id().cloned().unwrap_or_else(ItemId::root),
                i.name().to_string(),
                i.item.e_tag.clone(),
            )
        });
        let total_size = self.cache.size(id).unwrap_or(0);

        if let Some(mut existing) = self
            .store
            .get_upload(id)
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?
        {
            if !existing.state.is_terminal() {
                if matches!(priority, UploadPriority::High) {
                    existing.priority = UploadPriority::High;
                }
                existing.total_size = total_size;
                self.store
                    .put_upload(&existing)
                    .await
                    .map_err(|e| RemoteError::Internal(e.to_string()))?;
                debug!(id = %id, "upload already pending, coalesced");
                self.wake.notify_one();
                return Ok(());
            }
        }

        let mut session = UploadSession::new(
            id.clone(),
            parent_id,
            name,
            total_size,
            priority,
        );
        session.base_etag = base_etag;
        self.store
            .put_upload(&session)
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?;

        let mut queues = self.queues.lock().await;
        match priority {
            UploadPriority::High => queues.high.push_back(id.clone()),
            UploadPriority::Low => queues.low.push_back(id.clone()),
        }
        drop(queues);

        // the dirty bit clears on enqueue, not on completion; completion
        // observation happens asynchronously and updates status
        node.with_mut(|i| i.dirty = false);

        self.wake.notify_one();
        debug!(id = %id, ?priority, "upload enqueued");
        Ok(())
    }

    /// Queues a server-side deletion.
    pub async fn enqueue_deletion(&self, id: &ItemId) {
        let mut queues = self.queues.lock().await;
        if queues.deletions.iter().any(|d| d.id == *id) {
            return; // tombstones are absorbed
        }
        queues.deletions.push_back(PendingDeletion {
            id: id.clone(),
            retries: 0,
            not_before: None,
        });
        drop(queues);
        self.wake.notify_one();
    }

    /// Rehydrates persisted non-terminal sessions at process start.
    pub async fn rehydrate(&self) -> Result<usize, RemoteError> {
        let sessions = self
            .store
            .iter_uploads()
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?;
        let mut restored = 0usize;
        let mut queues = self.queues.lock().await;
        for mut session in sessions {
            if session.state.is_terminal() {
                let _ = self.store.delete_upload(&session.id).await;
                continue;
            }
            // mid-flight states resume through Starting; the persisted
            // endpoint and next_offset carry the resume point
            if !matches!(session.state, UploadState::Queued | UploadState::Retrying) {
                session.state = UploadState::Retrying;
                session.not_before = None;
                self.store
                    .put_upload(&session)
                    .await
                    .map_err(|e| RemoteError::Internal(e.to_string()))?;
            }
            match session.priority {
                UploadPriority::High => queues.high.push_back(session.id.clone()),
                UploadPriority::Low => queues.low.push_back(session.id.clone()),
            }
            restored += 1;
        }
        drop(queues);
        if restored > 0 {
            info!(restored, "upload sessions rehydrated");
            self.wake.notify_one();
        }
        Ok(restored)
    }

    /// Best-effort wait for the pending upload of `id` to reach a terminal
    /// state, bounded by `timeout`. Used by fsync.
    pub async fn wait_idle(&self, id: &ItemId, timeout: Duration) -> Result<(), RemoteError> {
        let pending = match self.store.get_upload(id).await {
            Ok(Some(session)) if !session.state.is_terminal() => true,
            _ => false,
        };
        if !pending && !self.active.contains_key(id.as_str()) {
            return Ok(());
        }

        let notify = self
            .completion
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();

        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(RemoteError::Timeout(format!(
                "upload of {id} still pending after {timeout:?}"
            ))),
        }
    }

    // ========================================================================
    // dispatch
    // ========================================================================

    /// Runs the dispatcher until shutdown. Spawn once.
    pub async fn run(self: Arc<Self>) {
        info!(workers = UPLOAD_WORKERS, "upload dispatcher started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("upload dispatcher stopped");
                    return;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(DISPATCH_TICK) => {}
            }

            if !self.online.is_online() {
                continue;
            }

            self.process_deletions().await;

            while let Some(id) = self.admit_next().await {
                let permit = tokio::select! {
                    permit = Arc::clone(&self.workers).acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => return,
                    },
                    _ = self.cancel.cancelled() => return,
                };

                let this = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    this.drive_session(&id).await;
                    this.active.remove(id.as_str());
                    if let Some(notify) = this.completion.get(id.as_str()) {
                        notify.notify_waiters();
                    }
                    this.wake.notify_one();
                });
            }
        }
    }

    /// Pops the next ready session id, preferring the high queue. Ids with
    /// a backoff deadline in the future rotate to the back of their queue.
    async fn admit_next(&self) -> Option<ItemId> {
        let mut queues = self.queues.lock().await;
        let queues = &mut *queues;
        for queue in [&mut queues.high, &mut queues.low] {
            let mut rotations = queue.len();
            while rotations > 0 {
                rotations -= 1;
                let Some(id) = queue.pop_front() else { break };
                if self.active.contains_key(id.as_str()) {
                    queue.push_back(id);
                    continue;
                }
                match self.store.get_upload(&id).await {
                    Ok(Some(session)) if session.state.is_terminal() => {
                        // stale queue entry; drop it
                    }
                    Ok(Some(session)) if session.is_ready() => {
                        self.active.insert(id.as_str().to_string(), ());
                        return Some(id);
                    }
                    Ok(Some(_)) => queue.push_back(id), // backoff not due yet
                    Ok(None) | Err(_) => {}
                }
            }
        }
        None
    }

    /// Processes the deletion sub-queue in order.
    async fn process_deletions(&self) {
        loop {
            let pending = {
                let mut queues = self.queues.lock().await;
                let Some(front) = queues.deletions.front() else {
                    return;
                };
                if front
                    .not_before
                    .is_some_and(|deadline| Utc::now() < deadline)
                {
                    return;
                }
                queues.deletions.pop_front()
            };
            let Some(mut pending) = pending else { return };

            match self.remote.delete(&pending.id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {
                    debug!(id = %pending.id, "server-side deletion complete");
                }
                Err(err) if err.is_connectivity() => {
                    self.online.set_online(false);
                    let mut queues = self.queues.lock().await;
                    queues.deletions.push_front(pending);
                    return;
                }
                Err(err) if err.is_transient() && pending.retries < MAX_DELETE_RETRIES => {
                    pending.retries += 1;
                    let delay = deletion_backoff(pending.retries, &err);
                    pending.not_before = Some(Utc::now() + delay);
                    warn!(id = %pending.id, retries = pending.retries, error = %err,
                          "deletion failed, will retry");
                    let mut queues = self.queues.lock().await;
                    queues.deletions.push_back(pending);
                }
                Err(err) => {
                    warn!(id = %pending.id, error = %err, "deletion failed terminally");
                    self.statuses.record_error(&pending.id, &err).await;
                }
            }
        }
    }

    // ========================================================================
    // session driver
    // ========================================================================

    /// Drives one session as far as it will go this attempt.
    async fn drive_session(&self, id: &ItemId) {
        let session = match self.store.get_upload(id).await {
            Ok(Some(session)) => session,
            _ => return,
        };
        if session.state.is_terminal() {
            return;
        }

        match self.attempt(session).await {
            Ok(()) => {}
            Err((mut session, err)) => {
                self.handle_failure(&mut session, err).await;
            }
        }
    }

    async fn persist(&self, session: &UploadSession) {
        if let Err(e) = self.store.put_upload(session).await {
            warn!(id = %session.id, error = %e, "failed to persist upload session");
        }
    }

    /// One attempt at a session. Returns the session with the error so the
    /// failure handler can schedule a retry against current state.
    async fn attempt(
        &self,
        mut session: UploadSession,
    ) -> Result<(), (UploadSession, RemoteError)> {
        let id = session.id.clone();

        if session.state == UploadState::Retrying || session.state == UploadState::Queued {
            if let Err(e) = session.transition_to(UploadState::Starting) {
                return Err((session, e));
            }
        }

        // the enclosing inode may be gone before the upload begins
        let inode_alive = self
            .tree
            .get(&id)
            .map(|node| !node.with(|i| i.tombstone))
            .unwrap_or(false);
        if !inode_alive {
            let _ = session.transition_to(UploadState::Cancelled);
            let _ = self.store.delete_upload(&id).await;
            info!(id = %id, "upload cancelled, inode deleted before start");
            return Ok(());
        }
        self.persist(&session).await;

        // refresh content length and hash from the cache
        let total = self.cache.size(&id).unwrap_or(0);
        session.total_size = total;
        let local_hash = match self.cache.hash(&id).await {
            Ok(hash) => hash,
            Err(e) => {
                return Err((session, RemoteError::Internal(format!("cache hash: {e}"))));
            }
        };
        session.content_hash = Some(local_hash.clone());

        let strategy = UploadStrategy::for_size(total, self.small_threshold);
        session.strategy = Some(strategy);

        let target = if id.is_local() {
            UploadTarget::NewChild {
                parent_id: session.parent_id.clone(),
                name: session.name.clone(),
            }
        } else {
            UploadTarget::Existing(id.clone())
        };

        self.statuses.transition(&id, FileStatus::Syncing).await;

        let item = match strategy {
            UploadStrategy::Small => self.upload_small(&mut session, &target).await,
            UploadStrategy::Chunked => self.upload_chunked(&mut session, &target, total).await,
        };
        let item = match item {
            Ok(item) => item,
            Err(err) => return Err((session, err)),
        };

        if let Err(e) = session.transition_to(UploadState::Finalizing) {
            return Err((session, e));
        }
        self.persist(&session).await;

        // the server's content hash must match what was streamed
        if let Some(server_hash) = item.quick_xor_hash() {
            if server_hash != local_hash {
                session.endpoint = None;
                session.next_offset = 0;
                return Err((
                    session,
                    RemoteError::Internal(format!(
                        "content hash mismatch after upload of {id}: {server_hash} != {local_hash}"
                    )),
                ));
            }
        }

        self.complete(session, item).await;
        Ok(())
    }

    async fn upload_small(
        &self,
        session: &mut UploadSession,
        target: &UploadTarget,
    ) -> Result<DriveItem, RemoteError> {
        session.transition_to(UploadState::UploadingSmall)?;
        self.persist(session).await;

        let bytes = self
            .cache
            .read_all(&session.id)
            .await
            .map_err(|e| RemoteError::Internal(format!("cache read: {e}")))?;
        let if_match = match target {
            UploadTarget::Existing(_) => session.base_etag.as_deref(),
            UploadTarget::NewChild { .. } => None,
        };
        self.remote.upload_small(target, &bytes, if_match).await
    }

    async fn upload_chunked(
        &self,
        session: &mut UploadSession,
        target: &UploadTarget,
        total: u64,
    ) -> Result<DriveItem, RemoteError> {
        session.transition_to(UploadState::UploadingChunked)?;
        session.chunk_size = self.chunk_size;

        let endpoint = match session.endpoint.clone() {
            Some(endpoint) if !endpoint.is_expired() => endpoint,
            _ => {
                let endpoint = self.remote.start_chunked_upload(target).await?;
                session.endpoint = Some(endpoint.clone());
                session.next_offset = 0;
                endpoint
            }
        };
        self.persist(session).await;

        loop {
            if self.cancel.is_cancelled() {
                return Err(RemoteError::Cancelled);
            }
            let offset = session.next_offset;
            if offset >= total {
                return Err(RemoteError::Internal(format!(
                    "chunked upload of {} ran past its length without completing",
                    session.id
                )));
            }
            let len = self.chunk_size.min(total - offset) as u32;
            let chunk = self
                .cache
                .read_at(&session.id, offset, len)
                .await
                .map_err(|e| RemoteError::Internal(format!("cache read: {e}")))?;

            let outcome = match self.remote.put_chunk(&endpoint, offset, total, &chunk).await {
                Ok(outcome) => outcome,
                Err(RemoteError::NotFound(_)) => {
                    // the session endpoint itself expired; restart cleanly
                    session.endpoint = None;
                    session.next_offset = 0;
                    return Err(RemoteError::NotFound(format!(
                        "upload endpoint for {} vanished",
                        session.id
                    )));
                }
                Err(err) => return Err(err),
            };

            match outcome {
                ChunkOutcome::Accepted { next_offset } => {
                    session.next_offset = next_offset;
                    self.persist(session).await;
                }
                ChunkOutcome::Complete(item) => {
                    return Ok(*item);
                }
            }
        }
    }

    /// Applies completion effects: server id adoption, ETag/hash/size
    /// refresh, status update, session retirement.
    async fn complete(&self, mut session: UploadSession, item: DriveItem) {
        let old_id = session.id.clone();
        let new_id = item.id.clone();

        let node = if old_id.is_local() && old_id != new_id {
            match self.tree.adopt_remote_id(&old_id, item.clone()) {
                Ok(node) => {
                    if let Err(e) = self.cache.rename_blob(&old_id, &new_id).await {
                        warn!(old = %old_id, new = %new_id, error = %e, "blob rename failed");
                    }
                    let snapshot = node.snapshot();
                    if let Err(e) = self.store.adopt_inode_id(&old_id, &snapshot).await {
                        warn!(old = %old_id, error = %e, "store id adoption failed");
                    }
                    Some(node)
                }
                Err(e) => {
                    warn!(id = %old_id, error = %e, "id adoption failed");
                    None
                }
            }
        } else {
            self.tree.get(&new_id).map(|node| {
                node.with_mut(|i| {
                    i.item.e_tag = item.e_tag.clone();
                    i.item.size = item.size;
                    i.item.last_modified_date_time = item.last_modified_date_time;
                    if let Some(hash) = item.quick_xor_hash() {
                        i.item.set_quick_xor_hash(hash.to_string());
                    }
                });
                node
            })
        };

        let still_dirty = node.is_some_and(|n| n.with(|i| i.dirty));
        let status = if still_dirty {
            FileStatus::LocalModified
        } else {
            FileStatus::Local
        };
        // the transition persists the refreshed inode and publishes
        self.statuses.transition(&new_id, status).await;

        session.id = new_id.clone();
        let _ = session.transition_to(UploadState::Completed);
        let _ = self.store.delete_upload(&old_id).await;
        let _ = self.store.delete_upload(&new_id).await;

        // re-key fsync waiters parked under the local id
        if old_id != new_id {
            if let Some((_, notify)) = self.completion.remove(old_id.as_str()) {
                notify.notify_waiters();
            }
        }

        info!(old = %old_id, new = %new_id, "upload complete");
    }

    /// Classifies a failure into retry, conflict, or terminal.
    async fn handle_failure(&self, session: &mut UploadSession, err: RemoteError) {
        let id = session.id.clone();

        match &err {
            RemoteError::Conflict(_) => {
                // the remote diverged under the local edit; the delta loop
                // owns the conflict-copy policy
                session.error = Some(err.to_string());
                session.state = UploadState::Failed;
                self.persist(session).await;
                if let Some(node) = self.tree.get(&id) {
                    node.with_mut(|i| i.dirty = true);
                }
                self.statuses.transition(&id, FileStatus::OutOfSync).await;
                warn!(id = %id, "upload hit a remote conflict, deferring to reconciliation");
            }
            err_ref if err_ref.is_connectivity() => {
                self.online.set_online(false);
                // pause, don't penalize: the session resumes on reconnect
                session.state = UploadState::Retrying;
                session.not_before = None;
                self.persist(session).await;
                self.requeue(&id, session.priority).await;
                self.statuses
                    .transition(&id, FileStatus::LocalModified)
                    .await;
            }
            _ if err.is_transient() || matches!(err, RemoteError::NotFound(_) | RemoteError::Unauthorized(_)) => {
                let retry_after = match &err {
                    RemoteError::RateLimited { retry_after } => {
                        Some(chrono::Duration::from_std(*retry_after).unwrap_or_default())
                    }
                    _ => None,
                };
                session.schedule_retry(err.to_string(), retry_after);
                if session.retries_exhausted() {
                    session.state = UploadState::Failed;
                    self.persist(session).await;
                    self.statuses.record_error(&id, &err).await;
                    warn!(id = %id, error = %err, "upload failed, retries exhausted");
                } else {
                    self.persist(session).await;
                    self.requeue(&id, session.priority).await;
                    debug!(id = %id, retries = session.retry_count, "upload retry scheduled");
                }
            }
            _ => {
                session.error = Some(err.to_string());
                session.state = UploadState::Failed;
                self.persist(session).await;
                self.statuses.record_error(&id, &err).await;
                warn!(id = %id, error = %err, "upload failed terminally");
            }
        }
    }

    async fn requeue(&self, id: &ItemId, priority: UploadPriority) {
        let mut queues = self.queues.lock().await;
        let queue = match priority {
            UploadPriority::High => &mut queues.high,
            UploadPriority::Low => &mut queues.low,
        };
        if !queue.contains(id) {
            queue.push_back(id.clone());
        }
    }
}

/// Backoff for deletion retries, honoring a rate-limit hint.
fn deletion_backoff(retries: u32, err: &RemoteError) -> chrono::Duration {
    if let RemoteError::RateLimited { retry_after } = err {
        return chrono::Duration::from_std(*retry_after).unwrap_or_else(|_| chrono::Duration::seconds(30));
    }
    let secs = 1i64 << retries.min(6);
    chrono::Duration::seconds(secs.min(60))
}
