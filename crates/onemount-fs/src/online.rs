//! Online/offline connectivity flag
//!
//! Shared by the filesystem engine, the transfer managers, and the delta
//! loop. Connectivity failures flip it off; the first subsequent successful
//! delta call flips it back on and triggers journal replay.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::info;

/// Process-wide connectivity state. Starts online.
pub struct OnlineState {
    online: AtomicBool,
    changed: Notify,
}

impl OnlineState {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            changed: Notify::new(),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Flips the flag; returns true when the value actually changed.
    pub fn set_online(&self, online: bool) -> bool {
        let previous = self.online.swap(online, Ordering::AcqRel);
        let changed = previous != online;
        if changed {
            info!(online, "connectivity changed");
            self.changed.notify_waiters();
        }
        changed
    }

    /// Waits for the next connectivity flip.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

impl Default for OnlineState {
    fn default() -> Self {
        Self::new()
    }
}
