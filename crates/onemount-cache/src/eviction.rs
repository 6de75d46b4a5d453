//! Age-based cache eviction
//!
//! A periodic sweep deletes blobs whose last access is older than the
//! configured age, and (when a size bound is set) the oldest evictable
//! blobs beyond it. The engine supplies the [`EvictionGate`]: only files
//! whose status permits it may be evicted, and the gate is told about every
//! eviction so it can downgrade the file's status.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::ContentCache;

/// Decides blob eviction eligibility and observes evictions.
pub trait EvictionGate: Send + Sync {
    /// May this blob be evicted? The engine answers false for dirty,
    /// uploading, conflicted, or currently-open content.
    fn may_evict(&self, id: &str) -> bool;

    /// Called after the blob has been deleted.
    fn on_evicted(&self, id: &str);
}

/// Handle to the running cleanup task.
pub struct CleanupHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Stops the cleanup task and waits for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Starts the periodic cleanup task.
///
/// `max_age_days` bounds blob idle age; `max_size_bytes` of 0 disables the
/// size bound.
pub fn start_cleanup(
    cache: Arc<ContentCache>,
    gate: Arc<dyn EvictionGate>,
    interval: Duration,
    max_age_days: u64,
    max_size_bytes: u64,
) -> CleanupHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("cache cleanup stopped");
                    return;
                }
                _ = ticker.tick() => {
                    sweep(&cache, gate.as_ref(), max_age_days, max_size_bytes).await;
                }
            }
        }
    });

    CleanupHandle { cancel, task }
}

/// One cleanup pass.
pub async fn sweep(
    cache: &ContentCache,
    gate: &dyn EvictionGate,
    max_age_days: u64,
    max_size_bytes: u64,
) {
    let max_age = Duration::from_secs(max_age_days * 24 * 60 * 60);
    let now = SystemTime::now();
    let mut entries = cache.iter();
    let mut evicted = 0u64;
    let mut freed = 0u64;
    let mut total: u64 = entries.iter().map(|e| e.length).sum();

    // Age pass: anything idle past the deadline.
    for entry in &entries {
        let idle = now
            .duration_since(entry.last_access)
            .unwrap_or(Duration::ZERO);
        if idle <= max_age {
            continue;
        }
        if !gate.may_evict(entry.id.as_str()) {
            continue;
        }
        match cache.delete(&entry.id).await {
            Ok(()) => {
                gate.on_evicted(entry.id.as_str());
                evicted += 1;
                freed += entry.length;
                total = total.saturating_sub(entry.length);
            }
            Err(e) => warn!(id = %entry.id, error = %e, "eviction failed"),
        }
    }

    // Size pass: oldest evictable blobs until under the bound.
    if max_size_bytes > 0 && total > max_size_bytes {
        entries.sort_by_key(|e| e.last_access);
        for entry in &entries {
            if total <= max_size_bytes {
                break;
            }
            if !cache.has(&entry.id) || !gate.may_evict(entry.id.as_str()) {
                continue;
            }
            match cache.delete(&entry.id).await {
                Ok(()) => {
                    gate.on_evicted(entry.id.as_str());
                    evicted += 1;
                    freed += entry.length;
                    total = total.saturating_sub(entry.length);
                }
                Err(e) => warn!(id = %entry.id, error = %e, "eviction failed"),
            }
        }
    }

    if evicted > 0 {
        info!(evicted, freed_bytes = freed, "cache cleanup pass complete");
    }
}
