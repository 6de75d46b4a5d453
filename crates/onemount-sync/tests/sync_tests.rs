//! Delta engine integration tests against a scripted remote.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use onemount_cache::ContentCache;
use onemount_core::domain::upload_session::UploadPriority;
use onemount_core::domain::{
    DeltaCursor, DriveItem, FileStatus, Inode, ItemId, JournalEntry, JournalOp, QuickXorHasher,
    RemoteError, UploadEndpoint,
};
use onemount_core::ports::publisher::NullPublisher;
use onemount_core::ports::{ChunkOutcome, DeltaBatch, DriveQuota, IRemoteClient, UploadTarget};
use onemount_fs::{InodeTree, OnlineState, StatusEngine, UploadManager};
use onemount_store::MetadataStore;
use onemount_sync::SyncEngine;

/// Remote stub with scripted delta batches and a content map.
#[derive(Default)]
struct ScriptedRemote {
    /// batches handed out in order; the last one repeats
    batches: Mutex<Vec<DeltaBatch>>,
    /// id -> content served by download
    content: Mutex<HashMap<String, Vec<u8>>>,
    /// items served by get_item (missing parents)
    items: Mutex<HashMap<String, DriveItem>>,
    /// force connectivity failure on delta
    unreachable: AtomicBool,
    /// deletions observed
    deleted: Mutex<Vec<String>>,
    /// renames observed
    renamed: Mutex<Vec<(String, String)>>,
}

impl ScriptedRemote {
    fn push_batch(&self, items: Vec<DriveItem>, cursor: &str) {
        self.batches.lock().unwrap().push(DeltaBatch {
            items,
            cursor: DeltaCursor::new(cursor).unwrap(),
        });
    }

    fn serve_content(&self, id: &str, bytes: &[u8]) {
        self.content
            .lock()
            .unwrap()
            .insert(id.to_string(), bytes.to_vec());
    }
}

fn file_item(id: &str, name: &str, parent: &str, etag: &str, content: &[u8]) -> DriveItem {
    let mut item = DriveItem::new_file(
        ItemId::new(id).unwrap(),
        name,
        ItemId::new(parent).unwrap(),
    );
    item.size = content.len() as u64;
    item.e_tag = Some(etag.to_string());
    item.set_quick_xor_hash(QuickXorHasher::hash_base64(content));
    item
}

fn deleted_item(id: &str) -> DriveItem {
    let mut item = DriveItem::new_file(ItemId::new(id).unwrap(), "gone", ItemId::root());
    item.file = None;
    item.deleted = Some(Default::default());
    item.parent_reference = None;
    item
}

#[async_trait::async_trait]
impl IRemoteClient for ScriptedRemote {
    async fn get_item(&self, id: &ItemId) -> Result<DriveItem, RemoteError> {
        self.items
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }
    async fn get_item_by_path(&self, path: &str) -> Result<DriveItem, RemoteError> {
        Err(RemoteError::NotFound(path.to_string()))
    }
    async fn get_child(&self, _p: &ItemId, name: &str) -> Result<DriveItem, RemoteError> {
        Err(RemoteError::NotFound(name.to_string()))
    }
    async fn list_children(&self, parent: &ItemId) -> Result<Vec<DriveItem>, RemoteError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.parent_id() == Some(parent))
            .cloned()
            .collect())
    }
    async fn create_folder(
        &self,
        parent: &ItemId,
        name: &str,
        _conflict_behavior: &str,
    ) -> Result<DriveItem, RemoteError> {
        let mut item = DriveItem::new_folder(
            ItemId::new(format!("SRV-DIR-{name}")).unwrap(),
            name,
            parent.clone(),
        );
        item.e_tag = Some("E-DIR".to_string());
        Ok(item)
    }
    async fn delete(&self, id: &ItemId) -> Result<(), RemoteError> {
        self.deleted.lock().unwrap().push(id.to_string());
        Ok(())
    }
    async fn rename_move(
        &self,
        id: &ItemId,
        _new_parent: &ItemId,
        new_name: &str,
    ) -> Result<DriveItem, RemoteError> {
        self.renamed
            .lock()
            .unwrap()
            .push((id.to_string(), new_name.to_string()));
        let mut item = DriveItem::new_file(id.clone(), new_name, ItemId::root());
        item.e_tag = Some("E-RENAMED".to_string());
        Ok(item)
    }
    async fn download(
        &self,
        id: &ItemId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        let content = self
            .content
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        sink.write_all(&content)
            .await
            .map_err(|e| RemoteError::Internal(e.to_string()))?;
        Ok(content.len() as u64)
    }
    async fn upload_small(
        &self,
        target: &UploadTarget,
        bytes: &[u8],
        _if_match: Option<&str>,
    ) -> Result<DriveItem, RemoteError> {
        let (name, id) = match target {
            UploadTarget::NewChild { name, .. } => {
                (name.clone(), format!("SRV-{name}"))
            }
            UploadTarget::Existing(id) => ("existing".to_string(), id.to_string()),
        };
        let mut item =
            DriveItem::new_file(ItemId::new(id).unwrap(), &name, ItemId::root());
        item.size = bytes.len() as u64;
        item.e_tag = Some("E2".to_string());
        item.set_quick_xor_hash(QuickXorHasher::hash_base64(bytes));
        Ok(item)
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
    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaBatch, RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::NetworkUnreachable("scripted outage".into()));
        }
        let batches = self.batches.lock().unwrap();
        match cursor {
            None => batches
                .first()
                .cloned()
                .ok_or_else(|| RemoteError::Internal("no scripted batch".into())),
            Some(cursor) => {
                // the batch after the one whose cursor matches; or an empty
                // batch reusing the same cursor
                let position = batches
                    .iter()
                    .position(|b| b.cursor.as_str() == cursor.as_str());
                match position.and_then(|p| batches.get(p + 1)) {
                    Some(batch) => Ok(batch.clone()),
                    None => Ok(DeltaBatch {
                        items: Vec::new(),
                        cursor: DeltaCursor::new(cursor.as_str()).unwrap(),
                    }),
                }
            }
        }
    }
    async fn get_drive_quota(&self) -> Result<DriveQuota, RemoteError> {
        Ok(DriveQuota {
            total: 1000,
            used: 10,
        })
    }
}

struct Fixture {
    engine: SyncEngine,
    remote: Arc<ScriptedRemote>,
    tree: Arc<InodeTree>,
    store: Arc<MetadataStore>,
    cache: Arc<ContentCache>,
    uploads: Arc<UploadManager>,
    online: Arc<OnlineState>,
    _dir: tempfile::TempDir,
}

async fn fixture(remote: ScriptedRemote) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(ContentCache::new(dir.path()).unwrap());
    let tree = Arc::new(InodeTree::new());
    let store = Arc::new(MetadataStore::in_memory().await.unwrap());
    let online = Arc::new(OnlineState::new());
    let remote = Arc::new(remote);
    let remote_dyn: Arc<dyn IRemoteClient> = remote.clone();

    let statuses = Arc::new(StatusEngine::new(
        Arc::clone(&tree),
        Arc::clone(&store),
        Arc::new(NullPublisher),
    ));
    let uploads = UploadManager::new(
        Arc::clone(&remote_dyn),
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&statuses),
        Arc::clone(&online),
        CancellationToken::new(),
    );
    let engine = SyncEngine::new(
        remote_dyn,
        Arc::clone(&store),
        Arc::clone(&cache),
        Arc::clone(&tree),
        Arc::clone(&uploads),
        statuses,
        Arc::clone(&online),
    );

    Fixture {
        engine,
        remote,
        tree,
        store,
        cache,
        uploads,
        online,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_initial_delta_populates_tree_and_cursor() {
    let remote = ScriptedRemote::default();
    remote.push_batch(
        vec![
            file_item("F1", "a.txt", "root", "E1", b"aa"),
            file_item("F2", "b.txt", "root", "E1", b"bb"),
        ],
        "cursor-1",
    );
    let fx = fixture(remote).await;

    let outcome = fx.engine.run_once().await.unwrap();
    assert_eq!(outcome.upserts, 2);
    assert_eq!(fx.tree.children_of(&ItemId::root()).len(), 2);
    assert_eq!(
        fx.store.get_cursor().await.unwrap().unwrap().as_str(),
        "cursor-1"
    );
    // inodes persisted
    assert_eq!(fx.store.inode_count().await.unwrap(), 2);
}

#[tokio::test]
async fn test_reapplying_same_delta_is_idempotent() {
    let remote = ScriptedRemote::default();
    remote.push_batch(
        vec![file_item("F1", "a.txt", "root", "E1", b"aa")],
        "cursor-1",
    );
    let fx = fixture(remote).await;

    fx.engine.run_once().await.unwrap();
    let before = fx.tree.children_of(&ItemId::root());

    // second run returns an empty batch with the same cursor; the tree is
    // unchanged either way
    fx.engine.run_once().await.unwrap();
    let after = fx.tree.children_of(&ItemId::root());
    assert_eq!(before.len(), after.len());
    assert_eq!(fx.tree.len(), 2); // root + F1
}

#[tokio::test]
async fn test_delta_deletion_removes_clean_inode() {
    let remote = ScriptedRemote::default();
    remote.push_batch(
        vec![file_item("F1", "a.txt", "root", "E1", b"aa")],
        "cursor-1",
    );
    remote.push_batch(vec![deleted_item("F1")], "cursor-2");
    let fx = fixture(remote).await;

    fx.engine.run_once().await.unwrap();
    fx.cache
        .write_at(&ItemId::new("F1").unwrap(), 0, b"aa")
        .await
        .unwrap();

    let outcome = fx.engine.run_once().await.unwrap();
    assert_eq!(outcome.deletions, 1);
    assert!(fx.tree.get(&ItemId::new("F1").unwrap()).is_none());
    assert!(!fx.cache.has(&ItemId::new("F1").unwrap()));
    assert_eq!(
        fx.store.get_cursor().await.unwrap().unwrap().as_str(),
        "cursor-2"
    );
}

#[tokio::test]
async fn test_delta_deletion_spares_dirty_inode() {
    let remote = ScriptedRemote::default();
    remote.push_batch(
        vec![file_item("F1", "a.txt", "root", "E1", b"aa")],
        "cursor-1",
    );
    remote.push_batch(vec![deleted_item("F1")], "cursor-2");
    let fx = fixture(remote).await;

    fx.engine.run_once().await.unwrap();
    let id = ItemId::new("F1").unwrap();
    fx.tree.get(&id).unwrap().with_mut(|i| i.dirty = true);

    let outcome = fx.engine.run_once().await.unwrap();
    assert_eq!(outcome.deletions, 0);
    assert!(fx.tree.get(&id).is_some());
}

#[tokio::test]
async fn test_conflict_materializes_copy_with_remote_content() {
    let remote = ScriptedRemote::default();
    remote.push_batch(
        vec![file_item("F1", "report.txt", "root", "E1", b"A")],
        "cursor-1",
    );
    // remote advanced to E2 with content "C" while local went dirty
    remote.push_batch(
        vec![file_item("F1", "report.txt", "root", "E2", b"C")],
        "cursor-2",
    );
    remote.serve_content("F1", b"C");
    let fx = fixture(remote).await;

    fx.engine.run_once().await.unwrap();
    let id = ItemId::new("F1").unwrap();
    // offline edit: local content "B"
    fx.cache.write_at(&id, 0, b"B").await.unwrap();
    fx.tree.get(&id).unwrap().with_mut(|i| i.dirty = true);
    fx.tree.set_status(&id, FileStatus::LocalModified);

    let outcome = fx.engine.run_once().await.unwrap();
    assert_eq!(outcome.conflicts, 1);

    // the original keeps the local edit and goes into conflict
    assert_eq!(fx.tree.status_of(&id).status, FileStatus::Conflict);
    assert_eq!(fx.cache.read_all(&id).await.unwrap(), b"B");
    // its base ETag advanced to the remote version
    assert_eq!(
        fx.tree.get(&id).unwrap().with(|i| i.item.e_tag.clone()),
        Some("E2".to_string())
    );

    // the sibling conflict copy carries the remote content
    let children = fx.tree.children_of(&ItemId::root());
    assert_eq!(children.len(), 2);
    let copy = children
        .iter()
        .find(|(_, name, _)| name.contains("Conflict Copy"))
        .expect("conflict copy should exist");
    assert!(copy.1.starts_with("report (Conflict Copy "));
    assert!(copy.1.ends_with(").txt"));
    assert_eq!(fx.cache.read_all(&copy.0).await.unwrap(), b"C");
}

#[tokio::test]
async fn test_offline_transition_and_journal_replay() {
    let remote = ScriptedRemote::default();
    remote.push_batch(vec![], "cursor-1");
    let fx = fixture(remote).await;

    // outage flips the engine offline
    fx.remote.unreachable.store(true, Ordering::SeqCst);
    let err = fx.engine.run_once().await.unwrap_err();
    assert!(matches!(err, RemoteError::NetworkUnreachable(_)));
    assert!(!fx.online.is_online());

    // offline mutations: a created file and a deleted server item
    let local = ItemId::local();
    let mut inode = Inode::new(DriveItem::new_file(
        local.clone(),
        "notes.txt",
        ItemId::root(),
    ));
    inode.dirty = true;
    fx.tree.insert(inode);
    fx.cache.write_at(&local, 0, b"v2").await.unwrap();
    fx.store
        .append_journal(&JournalEntry::new(
            local.clone(),
            JournalOp::Create {
                parent_id: ItemId::root(),
                name: "notes.txt".into(),
                is_dir: false,
            },
        ))
        .await
        .unwrap();

    let server_file = ItemId::new("OLD1").unwrap();
    let mut doomed = Inode::new(DriveItem::new_file(
        server_file.clone(),
        "old.txt",
        ItemId::root(),
    ));
    doomed.tombstone = true;
    fx.tree.insert(doomed);
    fx.store
        .append_journal(&JournalEntry::new(server_file.clone(), JournalOp::Delete))
        .await
        .unwrap();

    // reconnect: the first successful delta flips online and replays
    fx.remote.unreachable.store(false, Ordering::SeqCst);
    let outcome = fx.engine.run_once().await.unwrap();
    assert!(fx.online.is_online());
    assert_eq!(outcome.replayed, 2);

    // the create became an upload submission
    assert!(fx.store.get_upload(&local).await.unwrap().is_some());
    // the delete retired the tombstone locally
    assert!(fx.tree.get(&server_file).is_none());
    // the journal is drained; replaying again would do nothing
    assert_eq!(fx.store.journal_len().await.unwrap(), 0);
    assert_eq!(fx.engine.replay_journal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_offline_folder_create_replays_with_id_adoption() {
    let remote = ScriptedRemote::default();
    remote.push_batch(vec![], "cursor-1");
    let fx = fixture(remote).await;
    fx.online.set_online(false);

    let local_dir = ItemId::local();
    fx.tree.insert(Inode::new(DriveItem::new_folder(
        local_dir.clone(),
        "offline-folder",
        ItemId::root(),
    )));
    fx.store
        .append_journal(&JournalEntry::new(
            local_dir.clone(),
            JournalOp::Create {
                parent_id: ItemId::root(),
                name: "offline-folder".into(),
                is_dir: true,
            },
        ))
        .await
        .unwrap();

    fx.engine.run_once().await.unwrap();

    assert!(fx.tree.get(&local_dir).is_none());
    let adopted = ItemId::new("SRV-DIR-offline-folder").unwrap();
    let node = fx.tree.get(&adopted).expect("folder adopted server id");
    assert!(node.with(|i| i.is_dir()));
}

#[tokio::test]
async fn test_missing_parents_are_fetched() {
    let remote = ScriptedRemote::default();
    // the delta mentions a file whose parent the tree has never seen
    remote.push_batch(
        vec![file_item("DEEP1", "deep.txt", "MIDDLE", "E1", b"x")],
        "cursor-1",
    );
    remote.items.lock().unwrap().insert(
        "MIDDLE".to_string(),
        DriveItem::new_folder(
            ItemId::new("MIDDLE").unwrap(),
            "Middle",
            ItemId::root(),
        ),
    );
    let fx = fixture(remote).await;

    fx.engine.run_once().await.unwrap();

    let middle = ItemId::new("MIDDLE").unwrap();
    assert!(fx.tree.get(&middle).is_some());
    let children = fx.tree.children_of(&middle);
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].1, "deep.txt");
}

#[tokio::test]
async fn test_remote_change_on_clean_copy_drops_stale_content() {
    let remote = ScriptedRemote::default();
    remote.push_batch(
        vec![file_item("F1", "a.txt", "root", "E1", b"old")],
        "cursor-1",
    );
    remote.push_batch(
        vec![file_item("F1", "a.txt", "root", "E2", b"new")],
        "cursor-2",
    );
    let fx = fixture(remote).await;

    fx.engine.run_once().await.unwrap();
    let id = ItemId::new("F1").unwrap();
    fx.cache.write_at(&id, 0, b"old").await.unwrap();
    fx.tree.set_status(&id, FileStatus::Local);

    fx.engine.run_once().await.unwrap();

    // the stale blob is gone; the next read refetches
    assert!(!fx.cache.has(&id));
    assert_eq!(fx.tree.status_of(&id).status, FileStatus::Cloud);
    assert_eq!(
        fx.tree.get(&id).unwrap().with(|i| i.item.e_tag.clone()),
        Some("E2".to_string())
    );
}

#[tokio::test]
async fn test_walk_tree_populates_metadata_only() {
    let remote = ScriptedRemote::default();
    {
        let mut items = remote.items.lock().unwrap();
        items.insert(
            "D1".to_string(),
            DriveItem::new_folder(ItemId::new("D1").unwrap(), "Docs", ItemId::root()),
        );
        items.insert(
            "F1".to_string(),
            file_item("F1", "inside.txt", "D1", "E1", b"zz"),
        );
    }
    let fx = fixture(remote).await;

    let visited = fx.engine.walk_tree().await.unwrap();
    assert_eq!(visited, 2);
    assert!(fx.tree.get(&ItemId::new("D1").unwrap()).is_some());
    assert!(fx.tree.get(&ItemId::new("F1").unwrap()).is_some());
    // metadata only: no content was fetched
    assert!(!fx.cache.has(&ItemId::new("F1").unwrap()));
}

#[tokio::test]
async fn test_journal_delete_reaches_server_through_deletion_queue() {
    let remote = ScriptedRemote::default();
    remote.push_batch(vec![], "cursor-1");
    let fx = fixture(remote).await;
    fx.online.set_online(false);

    let server_file = ItemId::new("KILLME").unwrap();
    let mut doomed = Inode::new(DriveItem::new_file(
        server_file.clone(),
        "k.txt",
        ItemId::root(),
    ));
    doomed.tombstone = true;
    fx.tree.insert(doomed);
    fx.store
        .append_journal(&JournalEntry::new(server_file.clone(), JournalOp::Delete))
        .await
        .unwrap();

    // run the upload dispatcher so the deletion sub-queue drains
    let dispatcher = tokio::spawn(Arc::clone(&fx.uploads).run());

    fx.engine.run_once().await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    let deleted = fx.remote.deleted.lock().unwrap().clone();
    assert_eq!(deleted, vec!["KILLME".to_string()]);
    dispatcher.abort();
}

#[tokio::test]
async fn test_upload_enqueue_after_replay_is_deduplicated() {
    let remote = ScriptedRemote::default();
    remote.push_batch(vec![], "cursor-1");
    let fx = fixture(remote).await;
    fx.online.set_online(false);

    let local = ItemId::local();
    let mut inode = Inode::new(DriveItem::new_file(
        local.clone(),
        "dup.txt",
        ItemId::root(),
    ));
    inode.dirty = true;
    fx.tree.insert(inode);
    fx.cache.write_at(&local, 0, b"x").await.unwrap();

    // the same logical change journaled twice (create + modify)
    for op in [
        JournalOp::Create {
            parent_id: ItemId::root(),
            name: "dup.txt".into(),
            is_dir: false,
        },
        JournalOp::Modify,
    ] {
        fx.store
            .append_journal(&JournalEntry::new(local.clone(), op))
            .await
            .unwrap();
    }

    fx.engine.run_once().await.unwrap();

    // exactly one session exists for the id
    let sessions = fx.store.iter_uploads().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id, local);
    assert_eq!(sessions[0].priority, UploadPriority::Low);
}
