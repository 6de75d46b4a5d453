//! Shared error model
//!
//! `RemoteError` is the tagged error vocabulary every component speaks:
//! the remote client surfaces these, the upload/download managers retry on
//! the transient ones, and the filesystem engine maps them to POSIX codes.

use std::time::Duration;

use thiserror::Error;

/// Categorized errors surfaced by the remote client and propagated through
/// the engine. Retry policy lives with the callers; this layer only
/// classifies.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Requested id or path does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Token missing or rejected; recovered locally by token refresh
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Permission denied server-side
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Name collision or ETag precondition failure
    #[error("conflict: {0}")]
    Conflict(String),

    /// Rate limit exceeded; retry after the given duration
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Server-provided Retry-After hint
        retry_after: Duration,
    },

    /// The service could not be reached; callers transition to offline
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The request timed out
    #[error("timeout: {0}")]
    Timeout(String),

    /// Content exceeds a service limit
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The response could not be parsed
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Unexpected failure; fatal for the operation
    #[error("internal error: {0}")]
    Internal(String),

    /// Local-only observation: strict connectivity was required while offline
    #[error("offline")]
    Offline,

    /// Shutdown or user cancellation
    #[error("cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Returns true for errors that a bounded retry may recover from.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::RateLimited { .. }
                | RemoteError::NetworkUnreachable(_)
                | RemoteError::Timeout(_)
                | RemoteError::Internal(_)
        )
    }

    /// Returns true if the caller should flip the engine offline.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RemoteError::NetworkUnreachable(_) | RemoteError::Timeout(_)
        )
    }

    /// Short stable tag for logging and the stats view.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            RemoteError::NotFound(_) => "not-found",
            RemoteError::Unauthorized(_) => "unauthorized",
            RemoteError::Forbidden(_) => "forbidden",
            RemoteError::Conflict(_) => "conflict",
            RemoteError::RateLimited { .. } => "rate-limited",
            RemoteError::NetworkUnreachable(_) => "network-unreachable",
            RemoteError::Timeout(_) => "timeout",
            RemoteError::PayloadTooLarge(_) => "payload-too-large",
            RemoteError::Malformed(_) => "malformed",
            RemoteError::Internal(_) => "internal",
            RemoteError::Offline => "offline",
            RemoteError::Cancelled => "cancelled",
        }
    }
}
