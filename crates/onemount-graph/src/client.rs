//! HTTP client for the object-metadata service
//!
//! Wraps `reqwest::Client` with bearer authentication from an
//! [`ITokenProvider`], base-URL construction, and the mapping from HTTP
//! status codes onto the tagged [`RemoteError`] kinds. Retry policy lives
//! with the callers; the one recovery this layer performs is a single token
//! refresh on 401 followed by one replay of the request.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use onemount_core::domain::RemoteError;
use onemount_core::ports::ITokenProvider;

/// Base URL for the metadata service.
const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

/// Default Retry-After when the header is missing or unparsable.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Authenticated HTTP client for the metadata service.
pub struct DriveClient {
    client: Client,
    base_url: String,
    tokens: Arc<dyn ITokenProvider>,
}

impl DriveClient {
    /// Creates a client against the production service endpoint.
    pub fn new(tokens: Arc<dyn ITokenProvider>) -> Self {
        Self::with_base_url(tokens, GRAPH_BASE_URL)
    }

    /// Creates a client with a custom base URL (used by tests).
    pub fn with_base_url(tokens: Arc<dyn ITokenProvider>, base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            tokens,
        }
    }

    /// Returns the base URL for API requests.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the token provider.
    pub fn tokens(&self) -> &Arc<dyn ITokenProvider> {
        &self.tokens
    }

    /// Returns the underlying HTTP client, for absolute-URL requests such as
    /// upload session endpoints and delta nextLinks.
    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    /// Builds an authenticated request for a path relative to the base URL.
    pub(crate) async fn request(
        &self,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, RemoteError> {
        let token = self.tokens.bearer().await?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    /// Sends a request built by `build`, replaying it once after a token
    /// refresh if the first attempt comes back 401.
    pub(crate) async fn send<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let token = self.tokens.bearer().await?;
        let response = build(&self.client, &token)
            .send()
            .await
            .map_err(map_transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            debug!("401 from service, refreshing token and replaying once");
            let fresh = self.tokens.refresh().await?;
            let response = build(&self.client, &fresh)
                .send()
                .await
                .map_err(map_transport_error)?;
            return check_status(response).await;
        }

        check_status(response).await
    }

    /// Convenience: send a relative-path request and decode the JSON body.
    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let path = path.to_string();
        let base = self.base_url.clone();
        let response = self
            .send(move |client, token| {
                client
                    .request(Method::GET, format!("{base}{path}"))
                    .bearer_auth(token)
            })
            .await?;
        decode_json(response).await
    }
}

/// Decodes a JSON body, mapping parse failures to `malformed`.
pub(crate) async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    response
        .json::<T>()
        .await
        .map_err(|e| RemoteError::Malformed(e.to_string()))
}

/// Maps reqwest transport failures onto the tagged kinds.
pub(crate) fn map_transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        RemoteError::NetworkUnreachable(err.to_string())
    } else {
        RemoteError::Internal(err.to_string())
    }
}

/// Maps non-success HTTP statuses onto the tagged kinds.
pub(crate) async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = parse_retry_after(&response);
    let detail = body_excerpt(response).await;

    Err(match status {
        StatusCode::UNAUTHORIZED => RemoteError::Unauthorized(detail),
        StatusCode::FORBIDDEN => RemoteError::Forbidden(detail),
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound(detail),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => RemoteError::Conflict(detail),
        StatusCode::PAYLOAD_TOO_LARGE => RemoteError::PayloadTooLarge(detail),
        StatusCode::TOO_MANY_REQUESTS => RemoteError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        },
        StatusCode::REQUEST_TIMEOUT => RemoteError::Timeout(detail),
        s if s.is_server_error() => RemoteError::Internal(format!("{s}: {detail}")),
        s => {
            warn!(status = %s, "unexpected response status");
            RemoteError::Internal(format!("{s}: {detail}"))
        }
    })
}

/// Parses the Retry-After header (seconds form) if present.
fn parse_retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Reads a short excerpt of the error body for diagnostics.
async fn body_excerpt(response: Response) -> String {
    match response.text().await {
        Ok(body) if !body.is_empty() => body.chars().take(200).collect(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticTokens(&'static str);

    #[async_trait::async_trait]
    impl ITokenProvider for StaticTokens {
        async fn bearer(&self) -> Result<String, RemoteError> {
            Ok(self.0.to_string())
        }
        async fn refresh(&self) -> Result<String, RemoteError> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_request_builder_attaches_bearer() {
        let client = DriveClient::with_base_url(Arc::new(StaticTokens("tok-1")), "http://localhost:9");
        let req = client
            .request(Method::GET, "/me/drive")
            .await
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:9/me/drive");
        let auth = req.headers().get("authorization").unwrap().to_str().unwrap();
        assert_eq!(auth, "Bearer tok-1");
    }

    #[test]
    fn test_transport_error_mapping_is_connectivity() {
        // a refused connection should flip the engine offline
        let err = RemoteError::NetworkUnreachable("connection refused".into());
        assert!(err.is_connectivity());
    }
}
