//! Extended attributes
//!
//! The per-file status contract: `user.onemount.status` carries the ASCII
//! status string, `user.onemount.error` the last terminal error message.
//! These are always kept current, whether or not a desktop bus is attached.

use onemount_core::domain::StatusInfo;

/// Extended attribute holding the status string.
///
/// Values: `cloud`, `local`, `local-modified`, `syncing`, `downloading`,
/// `out-of-sync`, `error`, `conflict`.
pub const XATTR_STATUS: &str = "user.onemount.status";

/// Extended attribute holding the last terminal error message, if any.
pub const XATTR_ERROR: &str = "user.onemount.error";

/// Names returned by `listxattr`, error attribute included only when set.
pub fn list_xattrs(info: &StatusInfo) -> Vec<&'static str> {
    if info.error.is_some() {
        vec![XATTR_STATUS, XATTR_ERROR]
    } else {
        vec![XATTR_STATUS]
    }
}

/// Resolves one attribute value.
pub fn get_xattr(info: &StatusInfo, name: &str) -> Option<Vec<u8>> {
    match name {
        XATTR_STATUS => Some(info.status.to_string().into_bytes()),
        XATTR_ERROR => info.error.as_ref().map(|e| e.as_bytes().to_vec()),
        _ => None,
    }
}
