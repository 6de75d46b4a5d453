//! Named-collection metadata store
//!
//! Typed access to the five collections the engine persists. Values are
//! stored as JSON text (config values as raw bytes); keys are the item ids
//! the rest of the system already speaks.

use std::path::Path;

use sqlx::Row;
use tracing::debug;

use onemount_core::domain::{DeltaCursor, Inode, ItemId, JournalEntry, UploadSession};

use crate::lockfile::StoreLock;
use crate::pool::DatabasePool;
use crate::StoreError;

/// Key under which the single delta cursor row is stored.
const CURSOR_KEY: &str = "cursor";

/// The durable metadata store for one mount.
///
/// Holds the advisory lock for the database's lifetime; dropping the store
/// releases it.
pub struct MetadataStore {
    pool: DatabasePool,
    _lock: Option<StoreLock>,
}

impl MetadataStore {
    /// Opens the store at `db_path`, acquiring the advisory lock with the
    /// wait-and-retry policy.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let lock = StoreLock::acquire(db_path).await?;
        let pool = DatabasePool::new(db_path).await?;
        Ok(Self {
            pool,
            _lock: Some(lock),
        })
    }

    /// Opens an unlocked in-memory store for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = DatabasePool::in_memory().await?;
        Ok(Self { pool, _lock: None })
    }

    /// The underlying pool, for the stats report.
    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.pool.pool()
    }

    // ========================================================================
    // inodes
    // ========================================================================

    /// Upserts one inode. Atomic and durable upon return.
    pub async fn put_inode(&self, inode: &Inode) -> Result<(), StoreError> {
        let data = serde_json::to_string(inode)?;
        sqlx::query("INSERT INTO inodes (id, data) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET data = excluded.data")
            .bind(inode.id().as_str())
            .bind(data)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Fetches one inode.
    pub async fn get_inode(&self, id: &ItemId) -> Result<Option<Inode>, StoreError> {
        let row = sqlx::query("SELECT data FROM inodes WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool.pool())
            .await?;
        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    /// Deletes one inode.
    pub async fn delete_inode(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inodes WHERE id = ?")
            .bind(id.as_str())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Applies a batch of upserts and deletes to the inode collection in one
    /// all-or-nothing transaction.
    pub async fn apply_inode_batch(
        &self,
        upserts: &[Inode],
        deletes: &[ItemId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.pool().begin().await?;
        for inode in upserts {
            let data = serde_json::to_string(inode)?;
            sqlx::query("INSERT INTO inodes (id, data) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET data = excluded.data")
                .bind(inode.id().as_str())
                .bind(data)
                .execute(&mut *tx)
                .await?;
        }
        for id in deletes {
            sqlx::query("DELETE FROM inodes WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        debug!(
            upserts = upserts.len(),
            deletes = deletes.len(),
            "inode batch committed"
        );
        Ok(())
    }

    /// Rewrites an inode under a new id (server id adoption) atomically.
    pub async fn adopt_inode_id(
        &self,
        old_id: &ItemId,
        inode: &Inode,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(inode)?;
        let mut tx = self.pool.pool().begin().await?;
        sqlx::query("DELETE FROM inodes WHERE id = ?")
            .bind(old_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO inodes (id, data) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET data = excluded.data")
            .bind(inode.id().as_str())
            .bind(data)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Snapshot of every persisted inode.
    pub async fn iter_inodes(&self) -> Result<Vec<Inode>, StoreError> {
        let rows = sqlx::query("SELECT data FROM inodes")
            .fetch_all(self.pool.pool())
            .await?;
        let mut inodes = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data");
            inodes.push(serde_json::from_str(&data)?);
        }
        Ok(inodes)
    }

    /// Number of persisted inodes.
    pub async fn inode_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM inodes")
            .fetch_one(self.pool.pool())
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    // ========================================================================
    // delta cursor
    // ========================================================================

    /// Persists the delta cursor atomically.
    pub async fn set_cursor(&self, cursor: &DeltaCursor) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO delta (key, cursor) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET cursor = excluded.cursor")
            .bind(CURSOR_KEY)
            .bind(cursor.as_str())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Reads the delta cursor, if one has been persisted.
    pub async fn get_cursor(&self) -> Result<Option<DeltaCursor>, StoreError> {
        let row = sqlx::query("SELECT cursor FROM delta WHERE key = ?")
            .bind(CURSOR_KEY)
            .fetch_optional(self.pool.pool())
            .await?;
        match row {
            Some(row) => {
                let cursor: String = row.get("cursor");
                Ok(DeltaCursor::new(cursor).ok())
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // uploads
    // ========================================================================

    /// Persists an upload session keyed by its item id.
    pub async fn put_upload(&self, session: &UploadSession) -> Result<(), StoreError> {
        let data = serde_json::to_string(session)?;
        sqlx::query("INSERT INTO uploads (id, data) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET data = excluded.data")
            .bind(session.id.as_str())
            .bind(data)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Fetches the session for an id.
    pub async fn get_upload(&self, id: &ItemId) -> Result<Option<UploadSession>, StoreError> {
        let row = sqlx::query("SELECT data FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(self.pool.pool())
            .await?;
        match row {
            Some(row) => {
                let data: String = row.get("data");
                Ok(Some(serde_json::from_str(&data)?))
            }
            None => Ok(None),
        }
    }

    /// Removes the session for an id.
    pub async fn delete_upload(&self, id: &ItemId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(id.as_str())
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Rekeys a session after server id adoption, atomically.
    pub async fn adopt_upload_id(
        &self,
        old_id: &ItemId,
        session: &UploadSession,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(session)?;
        let mut tx = self.pool.pool().begin().await?;
        sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(old_id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO uploads (id, data) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET data = excluded.data")
            .bind(session.id.as_str())
            .bind(data)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Snapshot of every persisted session.
    pub async fn iter_uploads(&self) -> Result<Vec<UploadSession>, StoreError> {
        let rows = sqlx::query("SELECT data FROM uploads")
            .fetch_all(self.pool.pool())
            .await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let data: String = row.get("data");
            sessions.push(serde_json::from_str(&data)?);
        }
        Ok(sessions)
    }

    // ========================================================================
    // offline journal
    // ========================================================================

    /// Appends a journal entry, returning its sequence number.
    pub async fn append_journal(&self, entry: &JournalEntry) -> Result<i64, StoreError> {
        let data = serde_json::to_string(entry)?;
        let result = sqlx::query("INSERT INTO offline (data) VALUES (?)")
            .bind(data)
            .execute(self.pool.pool())
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// All journal entries in append order, with their sequence numbers.
    pub async fn journal_entries(&self) -> Result<Vec<(i64, JournalEntry)>, StoreError> {
        let rows = sqlx::query("SELECT seq, data FROM offline ORDER BY seq ASC")
            .fetch_all(self.pool.pool())
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let data: String = row.get("data");
            entries.push((seq, serde_json::from_str(&data)?));
        }
        Ok(entries)
    }

    /// Removes journal entries up to and including `seq` (post-replay).
    pub async fn trim_journal(&self, seq: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM offline WHERE seq <= ?")
            .bind(seq)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Number of pending journal entries.
    pub async fn journal_len(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM offline")
            .fetch_one(self.pool.pool())
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    // ========================================================================
    // config
    // ========================================================================

    /// Stores a small configuration blob.
    pub async fn set_config(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO config (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(self.pool.pool())
            .await?;
        Ok(())
    }

    /// Reads a configuration blob.
    pub async fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool.pool())
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    /// Database size info for the stats report: (page_count, page_size).
    pub async fn page_info(&self) -> Result<(u64, u64), StoreError> {
        let count_row = sqlx::query("PRAGMA page_count")
            .fetch_one(self.pool.pool())
            .await?;
        let size_row = sqlx::query("PRAGMA page_size")
            .fetch_one(self.pool.pool())
            .await?;
        let count: i64 = count_row.get(0);
        let size: i64 = size_row.get(0);
        Ok((count as u64, size as u64))
    }
}
