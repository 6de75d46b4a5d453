//! File-backed bearer token provider
//!
//! Token acquisition happens outside the mount process; the agreed handoff
//! is `auth_tokens.json` in the mount's cache directory. This provider reads
//! the file on demand and re-reads it on refresh, so an external refresher
//! can rotate tokens under a running mount.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use onemount_core::domain::RemoteError;
use onemount_core::ports::ITokenProvider;

/// On-disk token set, one per mountpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFile {
    /// Bearer token for API requests
    pub access_token: String,
    /// Refresh token, managed by the external auth flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token expiry
    pub expires_at: DateTime<Utc>,
    /// Account hint for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
}

impl TokenFile {
    /// Returns true once the access token has expired (with a small margin
    /// so requests in flight don't race the expiry).
    pub fn is_expired(&self) -> bool {
        Utc::now() + chrono::Duration::seconds(30) >= self.expires_at
    }
}

/// Token provider reading `auth_tokens.json`.
pub struct FileTokenProvider {
    path: PathBuf,
    cached: RwLock<Option<TokenFile>>,
}

impl FileTokenProvider {
    /// Creates a provider for the token file at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: RwLock::new(None),
        }
    }

    /// Returns the token file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Loads and validates the token file from disk.
    async fn load(&self) -> Result<TokenFile, RemoteError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            RemoteError::Unauthorized(format!(
                "cannot read token file {}: {e}",
                self.path.display()
            ))
        })?;
        let tokens: TokenFile = serde_json::from_str(&raw)
            .map_err(|e| RemoteError::Unauthorized(format!("invalid token file: {e}")))?;
        Ok(tokens)
    }
}

#[async_trait::async_trait]
impl ITokenProvider for FileTokenProvider {
    async fn bearer(&self) -> Result<String, RemoteError> {
        {
            let cached = self.cached.read().await;
            if let Some(tokens) = cached.as_ref() {
                if !tokens.is_expired() {
                    return Ok(tokens.access_token.clone());
                }
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<String, RemoteError> {
        let tokens = self.load().await?;
        if tokens.is_expired() {
            return Err(RemoteError::Unauthorized(
                "access token expired and no refresher is running".to_string(),
            ));
        }
        debug!(path = %self.path.display(), "token file (re)loaded");
        let access = tokens.access_token.clone();
        *self.cached.write().await = Some(tokens);
        Ok(access)
    }
}
