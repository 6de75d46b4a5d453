//! OneMount Sync - delta synchronization
//!
//! Keeps the metadata store and inode tree consistent with the server:
//! - [`engine`] - the delta loop body: reconciliation, conflict handling,
//!   offline/online transitions, and offline-journal replay
//! - [`scheduler`] - adaptive cadence driven by push-channel health

pub mod engine;
pub mod scheduler;

pub use engine::SyncEngine;
pub use scheduler::{SyncScheduler, SchedulerConfig};
