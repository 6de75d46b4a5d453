//! OneMount FS - the filesystem engine
//!
//! The POSIX-visible heart of OneMount:
//! - [`tree`] - the in-memory inode tree with child indexes and statuses
//! - [`filesystem`] - the `fuser::Filesystem` implementation
//! - [`download`] - bounded, deduplicating content materialization
//! - [`upload`] - the durable upload queue with resumable chunked sessions
//! - [`status`] - the status engine and conflict-copy naming
//! - [`gate`] - the cache eviction gate
//! - [`publisher`] - the optional D-Bus status bus
//! - [`xattr`] - the `user.onemount.*` extended attribute contract

pub mod download;
pub mod error;
pub mod filesystem;
pub mod gate;
pub mod online;
pub mod publisher;
pub mod status;
pub mod tree;
pub mod upload;
pub mod xattr;

pub use download::{DownloadManager, DownloadPhase};
pub use error::{errno_for_remote, ErrnoContext, FsError};
pub use filesystem::{FsConfig, OneMountFs};
pub use gate::TreeEvictionGate;
pub use online::OnlineState;
pub use status::{conflict_copy_name, unique_conflict_copy_name, StatusEngine};
pub use tree::{InodeTree, TreeNode};
pub use upload::UploadManager;
