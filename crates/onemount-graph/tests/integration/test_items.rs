//! Item metadata and content operation tests.

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use onemount_core::domain::{ItemId, RemoteError};
use onemount_core::ports::IRemoteClient;

use crate::common::{file_item_json, setup};

#[tokio::test]
async fn test_get_item_by_id() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/ITEM1"))
        .and(header("Authorization", "Bearer test-access-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_item_json("ITEM1", "a.txt", 5, "E1")),
        )
        .mount(&server)
        .await;

    let item = client.get_item(&ItemId::new("ITEM1").unwrap()).await.unwrap();
    assert_eq!(item.id.as_str(), "ITEM1");
    assert_eq!(item.name, "a.txt");
    assert_eq!(item.size, 5);
    assert!(item.is_file());
}

#[tokio::test]
async fn test_get_item_not_found() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/MISSING"))
        .respond_with(ResponseTemplate::new(404).set_body_string("item does not exist"))
        .mount(&server)
        .await;

    let err = client
        .get_item(&ItemId::new("MISSING").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
}

#[tokio::test]
async fn test_get_child_under_root() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root:/hello.txt:"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_item_json("CHILD1", "hello.txt", 5, "E1")),
        )
        .mount(&server)
        .await;

    let item = client.get_child(&ItemId::root(), "hello.txt").await.unwrap();
    assert_eq!(item.id.as_str(), "CHILD1");
}

#[tokio::test]
async fn test_list_children_follows_pagination() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/DIR1/children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("C1", "one.txt", 1, "E1")],
            "@odata.nextLink": format!("{}/page-two", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page-two"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("C2", "two.txt", 2, "E2")]
        })))
        .mount(&server)
        .await;

    let children = client
        .list_children(&ItemId::new("DIR1").unwrap())
        .await
        .unwrap();
    assert_eq!(children.len(), 2);
    assert_eq!(children[0].name, "one.txt");
    assert_eq!(children[1].name, "two.txt");
}

#[tokio::test]
async fn test_create_folder_sends_conflict_behavior() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/me/drive/root/children"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "id": "NEWDIR",
            "name": "Documents",
            "folder": { "childCount": 0 },
            "parentReference": { "id": "root" }
        })))
        .mount(&server)
        .await;

    let item = client
        .create_folder(&ItemId::root(), "Documents", "fail")
        .await
        .unwrap();
    assert!(item.is_dir());
    assert_eq!(item.id.as_str(), "NEWDIR");
}

#[tokio::test]
async fn test_delete_ok() {
    let (server, client) = setup().await;

    Mock::given(method("DELETE"))
        .and(path("/me/drive/items/GONE1"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    client.delete(&ItemId::new("GONE1").unwrap()).await.unwrap();
}

#[tokio::test]
async fn test_rename_move_patches_parent_and_name() {
    let (server, client) = setup().await;

    Mock::given(method("PATCH"))
        .and(path("/me/drive/items/MOVE1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "MOVE1",
            "name": "renamed.txt",
            "size": 9,
            "file": {},
            "parentReference": { "id": "DIRB" }
        })))
        .mount(&server)
        .await;

    let item = client
        .rename_move(
            &ItemId::new("MOVE1").unwrap(),
            &ItemId::new("DIRB").unwrap(),
            "renamed.txt",
        )
        .await
        .unwrap();
    assert_eq!(item.name, "renamed.txt");
    assert_eq!(item.parent_id().unwrap().as_str(), "DIRB");
}

#[tokio::test]
async fn test_download_streams_bytes() {
    let (server, client) = setup().await;
    let content = b"streamed file contents".to_vec();

    Mock::given(method("GET"))
        .and(path("/me/drive/items/DL1/content"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(content.clone())
                .append_header("Content-Type", "application/octet-stream"),
        )
        .mount(&server)
        .await;

    let mut sink = Vec::new();
    let written = client
        .download(&ItemId::new("DL1").unwrap(), &mut sink)
        .await
        .unwrap();
    assert_eq!(written, content.len() as u64);
    assert_eq!(sink, content);
}

#[tokio::test]
async fn test_rate_limited_carries_retry_after() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/items/BUSY1"))
        .respond_with(
            ResponseTemplate::new(429)
                .append_header("Retry-After", "17")
                .set_body_string("slow down"),
        )
        .mount(&server)
        .await;

    let err = client
        .get_item(&ItemId::new("BUSY1").unwrap())
        .await
        .unwrap_err();
    match err {
        RemoteError::RateLimited { retry_after } => {
            assert_eq!(retry_after.as_secs(), 17);
        }
        other => panic!("expected rate-limited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_drive_quota() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "id": "drive1",
            "quota": { "total": 5368709120_u64, "used": 1073741824_u64 }
        })))
        .mount(&server)
        .await;

    let quota = client.get_drive_quota().await.unwrap();
    assert_eq!(quota.total, 5_368_709_120);
    assert_eq!(quota.used, 1_073_741_824);
}
