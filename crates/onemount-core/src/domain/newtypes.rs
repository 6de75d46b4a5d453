//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers that cross component
//! boundaries. Each newtype ensures data validity at construction time.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::RemoteError;

/// Prefix carried by client-minted ids until the first successful upload
/// assigns a server id.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Remote id reserved for the drive root.
pub const ROOT_ID: &str = "root";

// ============================================================================
// ItemId
// ============================================================================

/// Identifier of a drive item.
///
/// Either a server-assigned id (stable, globally unique) or a client-minted
/// `local-<uuid>` placeholder for items created before their first upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Wraps an id string, rejecting empty values.
    pub fn new(id: impl Into<String>) -> Result<Self, RemoteError> {
        let id = id.into();
        if id.is_empty() {
            return Err(RemoteError::Malformed("empty item id".to_string()));
        }
        Ok(Self(id))
    }

    /// Mints a fresh local id for a not-yet-uploaded item.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4()))
    }

    /// The root item id.
    #[must_use]
    pub fn root() -> Self {
        Self(ROOT_ID.to_string())
    }

    /// Returns true if this id has not yet been assigned by the server.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// Returns true if this id names the drive root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_ID
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string.
    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// DeltaCursor
// ============================================================================

/// Opaque token identifying a point in the server's change log.
///
/// A valid cursor plus the remote service fully determines all changes since
/// that point; it advances monotonically along the server-observed sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeltaCursor(String);

impl DeltaCursor {
    /// Wraps a cursor string, rejecting empty values.
    pub fn new(token: impl Into<String>) -> Result<Self, RemoteError> {
        let token = token.into();
        if token.is_empty() {
            return Err(RemoteError::Malformed("empty delta cursor".to_string()));
        }
        Ok(Self(token))
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DeltaCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
