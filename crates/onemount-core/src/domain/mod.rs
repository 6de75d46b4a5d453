//! Domain entities and business logic
//!
//! This module contains the core domain types for OneMount:
//! - Newtypes for type-safe identifiers and validated domain values
//! - The serialized remote object (`DriveItem`) and its facets
//! - The per-file status state machine
//! - Upload session and offline journal entities
//! - The shared tagged error model
//! - The QuickXorHash content hash

pub mod drive_item;
pub mod errors;
pub mod hash;
pub mod inode;
pub mod journal;
pub mod newtypes;
pub mod status;
pub mod upload_session;

// Re-export commonly used types
pub use drive_item::{DriveItem, FileFacet, FolderFacet, ParentRef};
pub use errors::RemoteError;
pub use hash::QuickXorHasher;
pub use inode::Inode;
pub use journal::{JournalEntry, JournalOp};
pub use newtypes::{DeltaCursor, ItemId};
pub use status::{FileStatus, StatusInfo};
pub use upload_session::{UploadEndpoint, UploadPriority, UploadSession, UploadState, UploadStrategy};
