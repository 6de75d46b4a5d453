//! Upload endpoint tests.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use onemount_core::domain::{ItemId, RemoteError, UploadEndpoint};
use onemount_core::ports::{ChunkOutcome, IRemoteClient, UploadTarget};

use crate::common::{file_item_json, setup};

#[tokio::test]
async fn test_upload_small_new_child() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/me/drive/root:/hello.txt:/content"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(file_item_json("NEW1", "hello.txt", 5, "E1")),
        )
        .mount(&server)
        .await;

    let target = UploadTarget::NewChild {
        parent_id: ItemId::root(),
        name: "hello.txt".into(),
    };
    let item = client.upload_small(&target, b"hello", None).await.unwrap();
    assert_eq!(item.id.as_str(), "NEW1");
    assert_eq!(item.e_tag.as_deref(), Some("E1"));
}

#[tokio::test]
async fn test_upload_small_if_match_mismatch_is_conflict() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/me/drive/items/EXIST1/content"))
        .and(header("If-Match", "E1"))
        .respond_with(ResponseTemplate::new(412).set_body_string("precondition failed"))
        .mount(&server)
        .await;

    let target = UploadTarget::Existing(ItemId::new("EXIST1").unwrap());
    let err = client
        .upload_small(&target, b"v2", Some("E1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Conflict(_)));
}

#[tokio::test]
async fn test_start_chunked_upload_returns_endpoint() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/root:/big.bin:/createUploadSession"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "uploadUrl": format!("{}/upload-session/xyz", server.uri()),
            "expirationDateTime": "2026-08-02T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let target = UploadTarget::NewChild {
        parent_id: ItemId::root(),
        name: "big.bin".into(),
    };
    let endpoint = client.start_chunked_upload(&target).await.unwrap();
    assert!(endpoint.url.ends_with("/upload-session/xyz"));
    assert!(endpoint.expires_at.is_some());
}

#[tokio::test]
async fn test_put_chunk_intermediate_reports_next_offset() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/upload-session/xyz"))
        .respond_with(ResponseTemplate::new(202).set_body_json(serde_json::json!({
            "nextExpectedRanges": ["10485760-104857599"]
        })))
        .mount(&server)
        .await;

    let endpoint = UploadEndpoint {
        url: format!("{}/upload-session/xyz", server.uri()),
        expires_at: None,
    };
    let chunk = vec![0u8; 1024];
    let outcome = client
        .put_chunk(&endpoint, 0, 104_857_600, &chunk)
        .await
        .unwrap();
    match outcome {
        ChunkOutcome::Accepted { next_offset } => assert_eq!(next_offset, 10_485_760),
        ChunkOutcome::Complete(_) => panic!("expected intermediate ack"),
    }
}

#[tokio::test]
async fn test_put_chunk_final_returns_item() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/upload-session/xyz"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(file_item_json("DONE1", "big.bin", 104857600, "E9")),
        )
        .mount(&server)
        .await;

    let endpoint = UploadEndpoint {
        url: format!("{}/upload-session/xyz", server.uri()),
        expires_at: None,
    };
    let chunk = vec![0u8; 1024];
    let outcome = client
        .put_chunk(&endpoint, 104_856_576, 104_857_600, &chunk)
        .await
        .unwrap();
    match outcome {
        ChunkOutcome::Complete(item) => {
            assert_eq!(item.id.as_str(), "DONE1");
            assert_eq!(item.size, 104_857_600);
        }
        ChunkOutcome::Accepted { .. } => panic!("expected completion"),
    }
}

#[tokio::test]
async fn test_cancel_chunked_upload() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path("/upload-session/xyz"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let endpoint = UploadEndpoint {
        url: format!("{}/upload-session/xyz", server.uri()),
        expires_at: None,
    };
    client.cancel_chunked_upload(&endpoint).await.unwrap();
}

#[tokio::test]
async fn test_payload_too_large_surfaces() {
    let (server, client) = setup().await;

    Mock::given(method("PUT"))
        .and(path("/me/drive/root:/huge.txt:/content"))
        .respond_with(ResponseTemplate::new(413).set_body_string("too big"))
        .mount(&server)
        .await;

    let target = UploadTarget::NewChild {
        parent_id: ItemId::root(),
        name: "huge.txt".into(),
    };
    let err = client
        .upload_small(&target, &[0u8; 64], None)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::PayloadTooLarge(_)));
}
