//! Errno translation
//!
//! Maps the tagged remote errors and local filesystem failures onto the
//! POSIX codes the kernel bridge expects.

use thiserror::Error;

use onemount_core::domain::RemoteError;

/// Errors raised inside the filesystem engine.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("name too long: {0}")]
    NameTooLong(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl From<FsError> for libc::c_int {
    fn from(err: FsError) -> libc::c_int {
        match err {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NameTooLong(_) => libc::ENAMETOOLONG,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::Io(_) => libc::EIO,
            FsError::Remote(remote) => errno_for_remote(&remote, ErrnoContext::Metadata),
        }
    }
}

impl From<onemount_cache::CacheError> for FsError {
    fn from(err: onemount_cache::CacheError) -> Self {
        FsError::Io(err.to_string())
    }
}

impl From<onemount_store::StoreError> for FsError {
    fn from(err: onemount_store::StoreError) -> Self {
        FsError::Io(err.to_string())
    }
}

/// Which operation family a remote error surfaced from; `conflict` maps to
/// EEXIST for namespace operations and EBUSY for content operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrnoContext {
    /// lookup/getattr/readdir/create/mkdir/rename/unlink
    Metadata,
    /// read/write/flush/fsync on content
    Content,
}

/// POSIX code for a remote error in a given context.
pub fn errno_for_remote(err: &RemoteError, context: ErrnoContext) -> libc::c_int {
    match err {
        RemoteError::NotFound(_) => libc::ENOENT,
        RemoteError::Unauthorized(_) | RemoteError::Forbidden(_) => libc::EACCES,
        RemoteError::Conflict(_) => match context {
            ErrnoContext::Metadata => libc::EEXIST,
            ErrnoContext::Content => libc::EBUSY,
        },
        RemoteError::RateLimited { .. } => libc::EAGAIN,
        RemoteError::PayloadTooLarge(_) => libc::EFBIG,
        RemoteError::Cancelled => libc::EINTR,
        RemoteError::NetworkUnreachable(_)
        | RemoteError::Timeout(_)
        | RemoteError::Malformed(_)
        | RemoteError::Internal(_)
        | RemoteError::Offline => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_local_errno_mapping() {
        assert_eq!(libc::c_int::from(FsError::NotFound("x".into())), libc::ENOENT);
        assert_eq!(
            libc::c_int::from(FsError::NotEmpty("d".into())),
            libc::ENOTEMPTY
        );
        assert_eq!(
            libc::c_int::from(FsError::NameTooLong("n".into())),
            libc::ENAMETOOLONG
        );
    }

    #[test]
    fn test_remote_errno_mapping() {
        assert_eq!(
            errno_for_remote(&RemoteError::NotFound("x".into()), ErrnoContext::Metadata),
            libc::ENOENT
        );
        assert_eq!(
            errno_for_remote(&RemoteError::Unauthorized("x".into()), ErrnoContext::Metadata),
            libc::EACCES
        );
        assert_eq!(
            errno_for_remote(&RemoteError::Forbidden("x".into()), ErrnoContext::Content),
            libc::EACCES
        );
        assert_eq!(
            errno_for_remote(
                &RemoteError::RateLimited {
                    retry_after: Duration::from_secs(1)
                },
                ErrnoContext::Metadata
            ),
            libc::EAGAIN
        );
    }

    #[test]
    fn test_conflict_depends_on_context() {
        let conflict = RemoteError::Conflict("etag".into());
        assert_eq!(
            errno_for_remote(&conflict, ErrnoContext::Metadata),
            libc::EEXIST
        );
        assert_eq!(
            errno_for_remote(&conflict, ErrnoContext::Content),
            libc::EBUSY
        );
    }

    #[test]
    fn test_internal_and_malformed_are_eio() {
        assert_eq!(
            errno_for_remote(&RemoteError::Internal("x".into()), ErrnoContext::Content),
            libc::EIO
        );
        assert_eq!(
            errno_for_remote(&RemoteError::Malformed("x".into()), ErrnoContext::Metadata),
            libc::EIO
        );
    }
}
