//! Token provider port
//!
//! OAuth2 acquisition and refresh happen outside the core; this port yields
//! short-lived bearer tokens to the remote client. The engine recovers from
//! `unauthorized` by calling [`refresh`](ITokenProvider::refresh) once and
//! retrying the operation.

use crate::domain::RemoteError;

/// Supplies bearer tokens for the remote service.
#[async_trait::async_trait]
pub trait ITokenProvider: Send + Sync {
    /// Returns a currently-valid bearer token.
    async fn bearer(&self) -> Result<String, RemoteError>;

    /// Forces a refresh and returns the new token.
    ///
    /// Returns `RemoteError::Unauthorized` when no refresh is possible,
    /// which surfaces to the user as EACCES.
    async fn refresh(&self) -> Result<String, RemoteError>;
}
