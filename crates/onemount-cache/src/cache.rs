//! Blob storage keyed by item id
//!
//! Layout: `{cache_dir}/content/{prefix}/{id}` where `prefix` is the first
//! two hex characters of the id's SHA-256, fanning blobs out across
//! subdirectories while keeping the file name itself the item id. Partial
//! downloads live in `.partial` siblings. The blob mtime doubles as the
//! last-access time; the cache owns every write, and readers call
//! [`ContentCache::touch`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, SeekFrom};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

use onemount_core::domain::{ItemId, QuickXorHasher};

use crate::CacheError;

/// Suffix for in-progress download files.
const PARTIAL_SUFFIX: &str = ".partial";

/// One entry from a cache iteration.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Item id the blob belongs to
    pub id: ItemId,
    /// Blob length in bytes
    pub length: u64,
    /// Last access time
    pub last_access: SystemTime,
}

/// Disk-backed content cache.
pub struct ContentCache {
    content_dir: PathBuf,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl ContentCache {
    /// Creates the cache, ensuring the content directory exists.
    pub fn new(cache_dir: &Path) -> std::io::Result<Self> {
        let content_dir = cache_dir.join("content");
        std::fs::create_dir_all(&content_dir)?;
        Ok(Self {
            content_dir,
            locks: DashMap::new(),
        })
    }

    /// Canonical blob path for an id: `content/{prefix}/{id}`.
    pub fn blob_path(&self, id: &ItemId) -> PathBuf {
        self.content_dir.join(Self::prefix_of(id)).join(id.as_str())
    }

    /// Partial (in-progress) path for an id.
    pub fn partial_path(&self, id: &ItemId) -> PathBuf {
        self.content_dir
            .join(Self::prefix_of(id))
            .join(format!("{}{}", id.as_str(), PARTIAL_SUFFIX))
    }

    /// Two-character fan-out prefix derived from the id.
    fn prefix_of(id: &ItemId) -> String {
        let mut hasher = Sha256::new();
        hasher.update(id.as_str().as_bytes());
        let digest = hasher.finalize();
        format!("{:02x}", digest[0])
    }

    fn ensure_parent(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn lock_for(&self, id: &ItemId) -> Arc<RwLock<()>> {
        self.locks
            .entry(id.as_str().to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Returns true if a blob exists for the id.
    pub fn has(&self, id: &ItemId) -> bool {
        self.blob_path(id).exists()
    }

    /// Blob length, if cached.
    pub fn size(&self, id: &ItemId) -> Option<u64> {
        std::fs::metadata(self.blob_path(id)).ok().map(|m| m.len())
    }

    /// Reads up to `size` bytes at `offset`, shared with other readers.
    pub async fn read_at(
        &self,
        id: &ItemId,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, CacheError> {
        let lock = self.lock_for(id);
        let _guard = lock.read().await;

        let path = self.blob_path(id);
        let mut file = File::open(&path)
            .await
            .map_err(|_| CacheError::NotCached(id.to_string()))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buffer.len() {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    /// Writes `data` at `offset`, creating the blob if needed. Exclusive
    /// against readers and other writers. Returns the bytes written.
    pub async fn write_at(
        &self,
        id: &ItemId,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, CacheError> {
        let lock = self.lock_for(id);
        let _guard = lock.write().await;

        let path = self.blob_path(id);
        Self::ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(data.len() as u32)
    }

    /// Truncates the blob to `length`, creating it when absent.
    pub async fn truncate(&self, id: &ItemId, length: u64) -> Result<(), CacheError> {
        let lock = self.lock_for(id);
        let _guard = lock.write().await;

        let path = self.blob_path(id);
        Self::ensure_parent(&path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(length).await?;
        Ok(())
    }

    /// Reads the whole blob.
    pub async fn read_all(&self, id: &ItemId) -> Result<Vec<u8>, CacheError> {
        let lock = self.lock_for(id);
        let _guard = lock.read().await;
        tokio::fs::read(self.blob_path(id))
            .await
            .map_err(|_| CacheError::NotCached(id.to_string()))
    }

    /// Computes the QuickXorHash of the cached blob.
    pub async fn hash(&self, id: &ItemId) -> Result<String, CacheError> {
        let lock = self.lock_for(id);
        let _guard = lock.read().await;

        let mut file = File::open(self.blob_path(id))
            .await
            .map_err(|_| CacheError::NotCached(id.to_string()))?;
        let mut hasher = QuickXorHasher::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher.finalize_base64())
    }

    /// Removes the blob and any partial sibling. Idempotent.
    pub async fn delete(&self, id: &ItemId) -> Result<(), CacheError> {
        let lock = self.lock_for(id);
        let _guard = lock.write().await;

        let path = self.blob_path(id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        let partial = self.partial_path(id);
        if partial.exists() {
            let _ = tokio::fs::remove_file(&partial).await;
        }
        Ok(())
    }

    /// Rekeys a blob after server id adoption.
    pub async fn rename_blob(&self, old: &ItemId, new: &ItemId) -> Result<(), CacheError> {
        let old_lock = self.lock_for(old);
        let _old_guard = old_lock.write().await;
        let new_lock = self.lock_for(new);
        let _new_guard = new_lock.write().await;

        let from = self.blob_path(old);
        if from.exists() {
            let to = self.blob_path(new);
            Self::ensure_parent(&to)?;
            tokio::fs::rename(from, to).await?;
        }
        Ok(())
    }

    /// Updates the blob's last-access time to now.
    pub fn touch(&self, id: &ItemId) {
        let path = self.blob_path(id);
        let times = std::fs::FileTimes::new().set_modified(SystemTime::now());
        if let Ok(file) = std::fs::OpenOptions::new().append(true).open(&path) {
            if let Err(e) = file.set_times(times) {
                warn!(id = %id, error = %e, "failed to touch blob");
            }
        }
    }

    /// Snapshot of every cached blob with length and last-access time.
    pub fn iter(&self) -> Vec<CacheEntry> {
        let mut entries = Vec::new();
        let Ok(prefixes) = std::fs::read_dir(&self.content_dir) else {
            return entries;
        };
        for prefix in prefixes.flatten() {
            if !prefix.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let Ok(blobs) = std::fs::read_dir(prefix.path()) else {
                continue;
            };
            for entry in blobs.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let Ok(id) = ItemId::new(name) else { continue };
                let Ok(meta) = entry.metadata() else { continue };
                if !meta.is_file() {
                    continue;
                }
                entries.push(CacheEntry {
                    id,
                    length: meta.len(),
                    last_access: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                });
            }
        }
        entries
    }

    /// Total bytes and blob count.
    pub fn usage(&self) -> (u64, u64) {
        let mut bytes = 0u64;
        let mut count = 0u64;
        for entry in self.iter() {
            bytes += entry.length;
            count += 1;
        }
        (bytes, count)
    }

    /// Opens an exclusive writer that streams into the partial file and
    /// atomically promotes on hash-verified completion.
    pub async fn writer(&self, id: &ItemId) -> Result<BlobWriter, CacheError> {
        let lock = self.lock_for(id);
        let guard = lock.write_owned().await;

        let partial = self.partial_path(id);
        Self::ensure_parent(&partial)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)
            .await?;

        Ok(BlobWriter {
            id: id.clone(),
            file: Some(file),
            partial,
            canonical: self.blob_path(id),
            hasher: QuickXorHasher::new(),
            written: 0,
            _guard: guard,
        })
    }

    /// Removes a leftover partial file, keeping the canonical blob.
    pub async fn discard_partial(&self, id: &ItemId) -> Result<(), CacheError> {
        let partial = self.partial_path(id);
        if partial.exists() {
            tokio::fs::remove_file(&partial).await?;
        }
        Ok(())
    }
}

/// Exclusive streaming writer for one blob.
///
/// Bytes go to the `.partial` sibling; [`promote`](Self::promote) verifies
/// the hash and renames over the canonical blob. Dropping the writer
/// without promoting leaves the canonical blob untouched; the partial file
/// is removed by [`abandon`](Self::abandon) or the next cleanup.
pub struct BlobWriter {
    id: ItemId,
    file: Option<File>,
    partial: PathBuf,
    canonical: PathBuf,
    hasher: QuickXorHasher,
    written: u64,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl BlobWriter {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends a chunk, folding it into the running hash.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), CacheError> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CacheError::NotCached(self.id.to_string()))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Verifies the streamed hash against `expected` (when known) and
    /// atomically replaces the canonical blob.
    pub async fn promote(mut self, expected_hash: Option<&str>) -> Result<String, CacheError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }

        let computed = self.hasher.finalize_base64();
        if let Some(expected) = expected_hash {
            if expected != computed {
                let _ = tokio::fs::remove_file(&self.partial).await;
                return Err(CacheError::HashMismatch {
                    id: self.id.to_string(),
                    expected: expected.to_string(),
                    computed,
                });
            }
        }

        tokio::fs::rename(&self.partial, &self.canonical).await?;
        debug!(id = %self.id, bytes = self.written, "blob promoted");
        Ok(computed)
    }

    /// Drops the partial file without touching the canonical blob.
    pub async fn abandon(mut self) -> Result<(), CacheError> {
        self.file.take();
        if self.partial.exists() {
            tokio::fs::remove_file(&self.partial).await?;
        }
        Ok(())
    }
}

impl AsyncWrite for BlobWriter {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = &mut *self;
        let Some(file) = this.file.as_mut() else {
            return std::task::Poll::Ready(Err(std::io::Error::other("writer closed")));
        };
        match std::pin::Pin::new(file).poll_write(cx, buf) {
            std::task::Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                std::task::Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => std::pin::Pin::new(file).poll_flush(cx),
            None => std::task::Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.file.as_mut() {
            Some(file) => std::pin::Pin::new(file).poll_shutdown(cx),
            None => std::task::Poll::Ready(Ok(())),
        }
    }
}
