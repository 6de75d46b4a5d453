//! Shared test helpers for Graph API integration tests
//!
//! Provides wiremock-based mock server setup. Each helper mounts the
//! necessary mock endpoints and returns a configured DriveClient pointing at
//! the mock server.

use std::sync::Arc;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use onemount_core::domain::RemoteError;
use onemount_core::ports::ITokenProvider;
use onemount_graph::DriveClient;

/// Token provider handing out a fixed test token.
pub struct TestTokens;

#[async_trait::async_trait]
impl ITokenProvider for TestTokens {
    async fn bearer(&self) -> Result<String, RemoteError> {
        Ok("test-access-token".to_string())
    }
    async fn refresh(&self) -> Result<String, RemoteError> {
        Ok("test-access-token".to_string())
    }
}

/// Starts a mock server and returns it with a client pointed at it.
pub async fn setup() -> (MockServer, DriveClient) {
    let server = MockServer::start().await;
    let client = DriveClient::with_base_url(Arc::new(TestTokens), server.uri());
    (server, client)
}

/// A DriveItem body for a file.
pub fn file_item_json(id: &str, name: &str, size: u64, etag: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "name": name,
        "size": size,
        "eTag": etag,
        "lastModifiedDateTime": "2026-06-15T10:30:00Z",
        "parentReference": { "id": "root", "path": "/drive/root:" },
        "file": {
            "mimeType": "text/plain",
            "hashes": { "quickXorHash": "AAAAAAAAAAAAAAAAAAAAAAAAAAA=" }
        }
    })
}

/// Mounts a single-page delta endpoint.
pub async fn mount_delta_single_page(
    server: &MockServer,
    items: serde_json::Value,
    delta_token: &str,
) {
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": items,
            "@odata.deltaLink": format!(
                "{}/me/drive/root/delta?token={}",
                server.uri(),
                delta_token
            )
        })))
        .mount(server)
        .await;
}
