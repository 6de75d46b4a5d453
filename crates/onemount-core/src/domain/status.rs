//! Per-file status state machine
//!
//! Tracks the user-visible synchronization status of every file. The string
//! form of each state is the value published through the
//! `user.onemount.status` extended attribute and the status bus.
//!
//! ```text
//!   ┌───────┐  open/read   ┌─────────────┐  complete  ┌───────┐
//!   │ cloud │ ───────────► │ downloading │ ─────────► │ local │
//!   └───────┘              └─────────────┘            └───────┘
//!       ▲                                                  │ write
//!       │ evict                                            ▼
//!       │                 upload done   ┌─────────┐   ┌────────────────┐
//!       └──────── local ◄────────────── │ syncing │ ◄─┤ local-modified │
//!                                       └─────────┘   └────────────────┘
//!                                            │              │
//!                                 remote diverged           │ remote diverged
//!                                            ▼              ▼
//!                                       ┌─────────────┐  ┌──────────┐
//!                                       │ out-of-sync │─►│ conflict │
//!                                       └─────────────┘  └──────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::RemoteError;

/// User-visible synchronization status of a single file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileStatus {
    /// Inode exists; no cached content
    #[default]
    Cloud,
    /// The download manager holds an in-flight request
    Downloading,
    /// Cache holds content matching the server ETag
    Local,
    /// Cache holds content that differs from the server ETag
    LocalModified,
    /// An upload session is actively transferring or finalizing
    Syncing,
    /// Delta showed a remote change while the local copy was modified;
    /// temporary until reconciled
    OutOfSync,
    /// Last operation failed terminally
    Error,
    /// Both sides diverged; a conflict copy has been materialized
    Conflict,
}

impl FileStatus {
    /// Returns true if cached content is expected to exist for this status.
    #[must_use]
    pub fn has_content(&self) -> bool {
        matches!(
            self,
            FileStatus::Local
                | FileStatus::LocalModified
                | FileStatus::Syncing
                | FileStatus::OutOfSync
                | FileStatus::Conflict
        )
    }

    /// Returns true if the cached blob may be evicted in this status.
    ///
    /// Dirty, conflicted, or transferring content is never evicted.
    #[must_use]
    pub fn is_evictable(&self) -> bool {
        matches!(self, FileStatus::Cloud | FileStatus::Local)
    }

    /// Returns true if the file has changes the server has not seen.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        matches!(
            self,
            FileStatus::LocalModified | FileStatus::Syncing | FileStatus::OutOfSync
        )
    }

    /// Returns true if the file needs user attention.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        matches!(self, FileStatus::Conflict | FileStatus::Error)
    }

    /// Checks whether a transition to `target` is valid.
    ///
    /// `Error` may retry into any state; every state may enter `Error`.
    #[must_use]
    pub fn can_transition_to(&self, target: &FileStatus) -> bool {
        if matches!(self, FileStatus::Error) || matches!(target, FileStatus::Error) {
            return true;
        }
        if self == target {
            return true;
        }

        matches!(
            (self, target),
            (FileStatus::Cloud, FileStatus::Downloading)
                | (FileStatus::Cloud, FileStatus::LocalModified)
                | (FileStatus::Downloading, FileStatus::Local)
                | (FileStatus::Downloading, FileStatus::Cloud)
                | (FileStatus::Local, FileStatus::LocalModified)
                | (FileStatus::Local, FileStatus::Cloud)
                | (FileStatus::Local, FileStatus::Downloading)
                | (FileStatus::LocalModified, FileStatus::Syncing)
                | (FileStatus::LocalModified, FileStatus::OutOfSync)
                | (FileStatus::LocalModified, FileStatus::Conflict)
                | (FileStatus::LocalModified, FileStatus::Local)
                | (FileStatus::Syncing, FileStatus::Local)
                | (FileStatus::Syncing, FileStatus::LocalModified)
                | (FileStatus::Syncing, FileStatus::OutOfSync)
                | (FileStatus::Syncing, FileStatus::Conflict)
                | (FileStatus::OutOfSync, FileStatus::Conflict)
                | (FileStatus::OutOfSync, FileStatus::LocalModified)
                | (FileStatus::OutOfSync, FileStatus::Local)
                | (FileStatus::Conflict, FileStatus::Local)
                | (FileStatus::Conflict, FileStatus::Cloud)
                | (FileStatus::Conflict, FileStatus::LocalModified)
        )
    }

    /// Parses the xattr string form back into a status.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cloud" => Some(FileStatus::Cloud),
            "downloading" => Some(FileStatus::Downloading),
            "local" => Some(FileStatus::Local),
            "local-modified" => Some(FileStatus::LocalModified),
            "syncing" => Some(FileStatus::Syncing),
            "out-of-sync" => Some(FileStatus::OutOfSync),
            "error" => Some(FileStatus::Error),
            "conflict" => Some(FileStatus::Conflict),
            _ => None,
        }
    }

    /// All states, in stats-report order.
    #[must_use]
    pub fn all() -> [FileStatus; 8] {
        [
            FileStatus::Cloud,
            FileStatus::Local,
            FileStatus::LocalModified,
            FileStatus::Syncing,
            FileStatus::Downloading,
            FileStatus::OutOfSync,
            FileStatus::Error,
            FileStatus::Conflict,
        ]
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStatus::Cloud => "cloud",
            FileStatus::Downloading => "downloading",
            FileStatus::Local => "local",
            FileStatus::LocalModified => "local-modified",
            FileStatus::Syncing => "syncing",
            FileStatus::OutOfSync => "out-of-sync",
            FileStatus::Error => "error",
            FileStatus::Conflict => "conflict",
        };
        write!(f, "{s}")
    }
}

/// Status plus the last terminal error, as tracked per inode and exposed
/// through the `user.onemount.*` extended attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Current status
    pub status: FileStatus,
    /// Message of the last terminal error, if any
    pub error: Option<String>,
}

impl StatusInfo {
    /// Applies a terminal error: status becomes `Error` and the message is
    /// retained for `user.onemount.error`.
    pub fn record_error(&mut self, err: &RemoteError) {
        self.status = FileStatus::Error;
        self.error = Some(err.to_string());
    }

    /// Clears the stored error on a successful transition away from `Error`.
    pub fn set_status(&mut self, status: FileStatus) {
        if !matches!(status, FileStatus::Error) {
            self.error = None;
        }
        self.status = status;
    }
}
