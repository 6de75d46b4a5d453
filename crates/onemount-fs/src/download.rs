//! Download manager
//!
//! Materializes content from the remote service into the cache on demand:
//! a bounded worker pool, strict per-id deduplication (a second request for
//! an in-flight id receives the same completion signal), streaming into the
//! cache's exclusive writer, hash verification, and atomic promotion. On
//! any mid-stream failure the partial file is removed before the signal
//! resolves.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use onemount_cache::ContentCache;
use onemount_core::domain::{FileStatus, ItemId, RemoteError};
use onemount_core::ports::IRemoteClient;

use crate::online::OnlineState;
use crate::status::StatusEngine;
use crate::tree::InodeTree;

/// Progress of one download, broadcast to every waiter.
#[derive(Debug, Clone)]
pub enum DownloadPhase {
    /// Bytes are still on the wire
    InFlight,
    /// The cache holds verified content, or the download failed
    Done(Result<(), RemoteError>),
}

/// Bounded, deduplicating download pool.
pub struct DownloadManager {
    remote: Arc<dyn IRemoteClient>,
    cache: Arc<ContentCache>,
    tree: Arc<InodeTree>,
    statuses: Arc<StatusEngine>,
    online: Arc<OnlineState>,
    workers: Arc<Semaphore>,
    inflight: Arc<DashMap<String, watch::Receiver<DownloadPhase>>>,
    active_tasks: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    cancel: CancellationToken,
}

/// Decrements the live-worker count on every exit path of a worker task.
struct TaskGuard {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl DownloadManager {
    /// Creates the manager with a pool of `workers` concurrent downloads.
    pub fn new(
        remote: Arc<dyn IRemoteClient>,
        cache: Arc<ContentCache>,
        tree: Arc<InodeTree>,
        statuses: Arc<StatusEngine>,
        online: Arc<OnlineState>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            remote,
            cache,
            tree,
            statuses,
            online,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            inflight: Arc::new(DashMap::new()),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            cancel,
        }
    }

    /// Requests materialization of `id`, returning the completion signal.
    ///
    /// A request for an id already in flight returns the existing signal.
    pub fn request(&self, id: &ItemId) -> watch::Receiver<DownloadPhase> {
        if let Some(existing) = self.inflight.get(id.as_str()) {
            return existing.clone();
        }

        let (tx, rx) = watch::channel(DownloadPhase::InFlight);
        self.inflight.insert(id.as_str().to_string(), rx.clone());

        // fail fast when the engine is offline
        if !self.online.is_online() {
            self.inflight.remove(id.as_str());
            let _ = tx.send(DownloadPhase::Done(Err(RemoteError::Offline)));
            return rx;
        }

        let remote = Arc::clone(&self.remote);
        let cache = Arc::clone(&self.cache);
        let tree = Arc::clone(&self.tree);
        let statuses = Arc::clone(&self.statuses);
        let online = Arc::clone(&self.online);
        let workers = Arc::clone(&self.workers);
        let cancel = self.cancel.clone();
        let id = id.clone();
        let inflight_key = id.as_str().to_string();
        let inflight = Arc::clone(&self.inflight);

        // counted before spawn so shutdown() never misses a worker
        self.active_tasks.fetch_add(1, Ordering::AcqRel);
        let guard = TaskGuard {
            active: Arc::clone(&self.active_tasks),
            drained: Arc::clone(&self.drained),
        };

        tokio::spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                permit = workers.acquire_owned() => permit,
                _ = cancel.cancelled() => {
                    inflight.remove(&inflight_key);
                    let _ = tx.send(DownloadPhase::Done(Err(RemoteError::Cancelled)));
                    return;
                }
            };
            let _permit = match permit {
                Ok(p) => p,
                Err(_) => {
                    inflight.remove(&inflight_key);
                    let _ = tx.send(DownloadPhase::Done(Err(RemoteError::Cancelled)));
                    return;
                }
            };

            let result = tokio::select! {
                result = fetch_one(&remote, &cache, &tree, &statuses, &id) => result,
                _ = cancel.cancelled() => Err(RemoteError::Cancelled),
            };

            if let Err(ref err) = result {
                if err.is_connectivity() {
                    online.set_online(false);
                }
                // the signal must not resolve while a partial file remains
                let _ = cache.discard_partial(&id).await;
                statuses.transition(&id, FileStatus::Cloud).await;
                if !matches!(err, RemoteError::Cancelled | RemoteError::Offline) {
                    statuses.record_error(&id, err).await;
                }
                warn!(id = %id, error = %err, "download failed");
            }

            inflight.remove(&inflight_key);
            let _ = tx.send(DownloadPhase::Done(result));
        });

        rx
    }

    /// Waits until the download for `id` completes, bounded by `timeout`.
    ///
    /// Returns `Ok(())` immediately when nothing is in flight (the content
    /// is either already cached or was never requested).
    pub async fn wait(&self, id: &ItemId, timeout: Duration) -> Result<(), RemoteError> {
        let Some(rx) = self.inflight.get(id.as_str()).map(|r| r.clone()) else {
            return Ok(());
        };
        Self::wait_signal(rx, timeout).await
    }

    /// Waits on a completion signal obtained from [`request`](Self::request).
    pub async fn wait_signal(
        mut rx: watch::Receiver<DownloadPhase>,
        timeout: Duration,
    ) -> Result<(), RemoteError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if let DownloadPhase::Done(result) = rx.borrow().clone() {
                return result;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RemoteError::Cancelled);
                    }
                }
                _ = &mut deadline => {
                    return Err(RemoteError::Timeout(format!(
                        "download still in flight after {timeout:?}"
                    )));
                }
            }
        }
    }

    /// Returns true while a download for `id` is in flight.
    pub fn is_inflight(&self, id: &ItemId) -> bool {
        self.inflight.contains_key(id.as_str())
    }

    /// Cancels all in-flight downloads and waits until every worker task
    /// has exited. Bound the wait on the caller's side.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        loop {
            let drained = self.drained.notified();
            if self.active_tasks.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// One materialization: status `downloading`, stream, verify, promote,
/// status `local`. Every step publishes through the status engine.
async fn fetch_one(
    remote: &Arc<dyn IRemoteClient>,
    cache: &Arc<ContentCache>,
    tree: &Arc<InodeTree>,
    statuses: &Arc<StatusEngine>,
    id: &ItemId,
) -> Result<(), RemoteError> {
    let node = tree
        .get(id)
        .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
    let expected_hash = node.with(|i| i.item.quick_xor_hash().map(str::to_string));

    statuses.transition(id, FileStatus::Downloading).await;

    let mut writer = cache
        .writer(id)
        .await
        .map_err(|e| RemoteError::Internal(format!("cache writer: {e}")))?;

    let streamed = remote.download(id, &mut writer).await;
    let bytes = match streamed {
        Ok(bytes) => bytes,
        Err(err) => {
            let _ = writer.abandon().await;
            return Err(err);
        }
    };

    writer
        .promote(expected_hash.as_deref())
        .await
        .map_err(|e| RemoteError::Internal(e.to_string()))?;

    cache.touch(id);
    statuses.transition(id, FileStatus::Local).await;
    debug!(id = %id, bytes, "content materialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use onemount_core::domain::{DeltaCursor, DriveItem, Inode, UploadEndpoint};
    use onemount_core::ports::publisher::NullPublisher;
    use onemount_core::ports::{
        ChunkOutcome, DeltaBatch, DriveQuota, IStatusPublisher, UploadTarget,
    };
    use onemount_store::MetadataStore;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWrite;
    use tokio::io::AsyncWriteExt;

    /// Publisher that records every event for assertions.
    #[derive(Default)]
    struct RecordingPublisher {
        events: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait::async_trait]
    impl IStatusPublisher for RecordingPublisher {
        async fn publish(&self, id: &ItemId, _path: &str, status: &FileStatus) {
            self.events
                .lock()
                .unwrap()
                .push((id.to_string(), status.to_string()));
        }
    }

    async fn status_engine(
        tree: &Arc<InodeTree>,
        publisher: Arc<dyn IStatusPublisher>,
    ) -> Arc<StatusEngine> {
        let store = Arc::new(MetadataStore::in_memory().await.unwrap());
        Arc::new(StatusEngine::new(Arc::clone(tree), store, publisher))
    }

    /// Remote stub serving one blob, counting download calls.
    struct StubRemote {
        content: Vec<u8>,
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl StubRemote {
        fn serving(content: &[u8]) -> Self {
            Self {
                content: content.to_vec(),
                calls: AtomicUsize::new(0),
                fail: false,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                content: Vec::new(),
                calls: AtomicUsize::new(0),
                fail: true,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait::async_trait]
    impl IRemoteClient for StubRemote {
        async fn get_item(&self, id: &ItemId) -> Result<DriveItem, RemoteError> {
            Err(RemoteError::NotFound(id.to_string()))
        }
        async fn get_item_by_path(&self, path: &str) -> Result<DriveItem, RemoteError> {
            Err(RemoteError::NotFound(path.to_string()))
        }
        async fn get_child(&self, _p: &ItemId, name: &str) -> Result<DriveItem, RemoteError> {
            Err(RemoteError::NotFound(name.to_string()))
        }
        async fn list_children(&self, _p: &ItemId) -> Result<Vec<DriveItem>, RemoteError> {
            Ok(Vec::new())
        }
        async fn create_folder(
            &self,
            _p: &ItemId,
            _n: &str,
            _c: &str,
        ) -> Result<DriveItem, RemoteError> {
            Err(RemoteError::Internal("unused".into()))
        }
        async fn delete(&self, _id: &ItemId) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn rename_move(
            &self,
            _id: &ItemId,
            _p: &ItemId,
            _n: &str,
        ) -> Result<DriveItem, RemoteError> {
            Err(RemoteError::Internal("unused".into()))
        }
        async fn download(
            &self,
            _id: &ItemId,
            sink: &mut (dyn AsyncWrite + Send + Unpin),
        ) -> Result<u64, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                // half a payload, then a network failure
                sink.write_all(b"partial").await.ok();
                return Err(RemoteError::NetworkUnreachable("mid-stream".into()));
            }
            sink.write_all(&self.content)
                .await
                .map_err(|e| RemoteError::Internal(e.to_string()))?;
            Ok(self.content.len() as u64)
        }
        async fn upload_small(
            &self,
            _t: &UploadTarget,
            _b: &[u8],
            _e: Option<&str>,
        ) -> Result<DriveItem, RemoteError> {
            Err(RemoteError::Internal("unused".into()))
        }
        async fn start_chunked_upload(
            &self,
            _t: &UploadTarget,
        ) -> Result<UploadEndpoint, RemoteError> {
            Err(RemoteError::Internal("unused".into()))
        }
        async fn put_chunk(
            &self,
            _e: &UploadEndpoint,
            _o: u64,
            _t: u64,
            _b: &[u8],
        ) -> Result<ChunkOutcome, RemoteError> {
            Err(RemoteError::Internal("unused".into()))
        }
        async fn cancel_chunked_upload(&self, _e: &UploadEndpoint) -> Result<(), RemoteError> {
            Ok(())
        }
        async fn delta(&self, _c: Option<&DeltaCursor>) -> Result<DeltaBatch, RemoteError> {
            Err(RemoteError::Internal("unused".into()))
        }
        async fn get_drive_quota(&self) -> Result<DriveQuota, RemoteError> {
            Ok(DriveQuota::default())
        }
    }

    async fn setup(
        remote: StubRemote,
        content_hash: Option<String>,
    ) -> (DownloadManager, Arc<InodeTree>, Arc<ContentCache>, ItemId, tempfile::TempDir) {
        setup_with_publisher(remote, content_hash, Arc::new(NullPublisher)).await
    }

    async fn setup_with_publisher(
        remote: StubRemote,
        content_hash: Option<String>,
        publisher: Arc<dyn IStatusPublisher>,
    ) -> (DownloadManager, Arc<InodeTree>, Arc<ContentCache>, ItemId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
        let tree = Arc::new(InodeTree::new());
        let statuses = status_engine(&tree, publisher).await;
        let online = Arc::new(OnlineState::new());

        let id = ItemId::new("DL1").unwrap();
        let mut item = DriveItem::new_file(id.clone(), "dl.bin", ItemId::root());
        if let Some(hash) = content_hash {
            item.set_quick_xor_hash(hash);
        }
        tree.insert(Inode::new(item));

        let manager = DownloadManager::new(
            Arc::new(remote),
            Arc::clone(&cache),
            Arc::clone(&tree),
            statuses,
            online,
            2,
            CancellationToken::new(),
        );
        (manager, tree, cache, id, dir)
    }

    #[tokio::test]
    async fn test_download_materializes_and_sets_local() {
        let content = b"file payload";
        let hash = onemount_core::domain::QuickXorHasher::hash_base64(content);
        let (manager, tree, cache, id, _dir) =
            setup(StubRemote::serving(content), Some(hash)).await;

        let rx = manager.request(&id);
        DownloadManager::wait_signal(rx, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(cache.read_all(&id).await.unwrap(), content);
        assert_eq!(tree.status_of(&id).status, FileStatus::Local);
        assert!(!manager.is_inflight(&id));
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_deduplicated() {
        let mut remote = StubRemote::serving(b"slow payload");
        remote.delay = Duration::from_millis(100);
        let calls_probe = Arc::new(remote);
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
        let tree = Arc::new(InodeTree::new());
        let statuses = status_engine(&tree, Arc::new(NullPublisher)).await;
        let id = ItemId::new("DL1").unwrap();
        tree.insert(Inode::new(DriveItem::new_file(
            id.clone(),
            "dl.bin",
            ItemId::root(),
        )));
        let remote_dyn: Arc<dyn IRemoteClient> = calls_probe.clone();
        let manager = DownloadManager::new(
            remote_dyn,
            cache,
            tree,
            statuses,
            Arc::new(OnlineState::new()),
            4,
            CancellationToken::new(),
        );

        let rx = manager.request(&id);
        let _b = manager.request(&id);
        let _c = manager.request(&id);
        DownloadManager::wait_signal(rx, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(calls_probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_download_removes_partial_and_rolls_back() {
        let (manager, tree, cache, id, _dir) = setup(StubRemote::failing(), None).await;

        let rx = manager.request(&id);
        let err = DownloadManager::wait_signal(rx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NetworkUnreachable(_)));

        assert!(!cache.has(&id));
        assert!(!cache.partial_path(&id).exists());
        // the inode rolls back out of `downloading`
        let status = tree.status_of(&id).status;
        assert_ne!(status, FileStatus::Downloading);
        assert_ne!(status, FileStatus::Local);
    }

    #[tokio::test]
    async fn test_offline_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
        let tree = Arc::new(InodeTree::new());
        let statuses = status_engine(&tree, Arc::new(NullPublisher)).await;
        let online = Arc::new(OnlineState::new());
        online.set_online(false);

        let id = ItemId::new("DL1").unwrap();
        tree.insert(Inode::new(DriveItem::new_file(
            id.clone(),
            "dl.bin",
            ItemId::root(),
        )));

        let manager = DownloadManager::new(
            Arc::new(StubRemote::serving(b"never served")),
            cache,
            tree,
            statuses,
            online,
            2,
            CancellationToken::new(),
        );

        let mut rx = manager.request(&id);
        // the signal resolves without any network round trip
        let phase = rx.borrow_and_update().clone();
        match phase {
            DownloadPhase::Done(Err(RemoteError::Offline)) => {}
            other => panic!("expected offline failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hash_mismatch_fails_download() {
        let (manager, _tree, cache, id, _dir) =
            setup(StubRemote::serving(b"payload"), Some("WRONGHASH=".to_string())).await;

        let rx = manager.request(&id);
        let err = DownloadManager::wait_signal(rx, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Internal(_)));
        assert!(!cache.has(&id));
    }

    #[tokio::test]
    async fn test_download_publishes_status_events() {
        let content = b"published payload";
        let hash = onemount_core::domain::QuickXorHasher::hash_base64(content);
        let publisher = Arc::new(RecordingPublisher::default());
        let (manager, _tree, _cache, id, _dir) = setup_with_publisher(
            StubRemote::serving(content),
            Some(hash),
            publisher.clone(),
        )
        .await;

        let rx = manager.request(&id);
        DownloadManager::wait_signal(rx, Duration::from_secs(5))
            .await
            .unwrap();

        let events = publisher.events.lock().unwrap().clone();
        let statuses: Vec<&str> = events.iter().map(|(_, s)| s.as_str()).collect();
        assert_eq!(statuses, vec!["downloading", "local"]);
        assert!(events.iter().all(|(event_id, _)| event_id == id.as_str()));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_workers() {
        let mut remote = StubRemote::serving(b"slow payload");
        remote.delay = Duration::from_millis(100);
        let (manager, _tree, _cache, id, _dir) = setup(remote, None).await;

        let rx = manager.request(&id);
        manager.shutdown().await;

        // after shutdown returns, no worker is left and the signal resolved
        assert!(!manager.is_inflight(&id));
        let err = DownloadManager::wait_signal(rx, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Cancelled));
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_in_flight_returns_immediately() {
        let (manager, _tree, _cache, _id, _dir) = setup(StubRemote::serving(b"x"), None).await;
        tokio::time::timeout(Duration::from_millis(200), manager.shutdown())
            .await
            .expect("shutdown should not block");
    }
}
