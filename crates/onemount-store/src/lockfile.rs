//! Advisory lock for single-holder database access
//!
//! One mount owns one metadata database. The lock file holds the owner's
//! pid; opening waits-and-retries while a previous holder is still exiting,
//! and reclaims locks whose file is older than five minutes.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::StoreError;

/// Lock files older than this are presumed stale and reclaimed.
pub const STALE_LOCK_AGE: Duration = Duration::from_secs(5 * 60);

/// How long `acquire` waits for a live holder to release.
pub const ACQUIRE_DEADLINE: Duration = Duration::from_secs(10);

/// Poll interval while waiting.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Held advisory lock; releases on drop.
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    /// Acquires the lock beside the database file.
    ///
    /// Waits up to [`ACQUIRE_DEADLINE`] for a live previous holder, and
    /// reclaims a lock file older than [`STALE_LOCK_AGE`] immediately.
    pub async fn acquire(db_path: &Path) -> Result<Self, StoreError> {
        let path = db_path.with_extension("lock");
        let deadline = SystemTime::now() + ACQUIRE_DEADLINE;

        loop {
            match try_create(&path) {
                Ok(()) => {
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        warn!(path = %path.display(), "reclaiming stale store lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    if SystemTime::now() >= deadline {
                        return Err(StoreError::Unavailable(format!(
                            "store lock {} still held after {:?}",
                            path.display(),
                            ACQUIRE_DEADLINE
                        )));
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "cannot create store lock {}: {e}",
                        path.display()
                    )));
                }
            }
        }
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove store lock");
        } else {
            info!(path = %self.path.display(), "store lock released");
        }
    }
}

/// Creates the lock file exclusively, writing the owner pid.
fn try_create(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    let file = options.open(path)?;
    use std::io::Write;
    let mut file = file;
    write!(&mut file, "{}", std::process::id())?;
    Ok(())
}

/// Returns true when the lock file's mtime exceeds the stale age.
fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|mtime| {
            SystemTime::now()
                .duration_since(mtime)
                .map(|age| age > STALE_LOCK_AGE)
                .unwrap_or(false)
        })
        .unwrap_or(false)
}
