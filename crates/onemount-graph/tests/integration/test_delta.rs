//! Delta query tests.

use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, ResponseTemplate};

use onemount_core::domain::DeltaCursor;
use onemount_core::ports::IRemoteClient;

use crate::common::{file_item_json, mount_delta_single_page, setup};

#[tokio::test]
async fn test_initial_delta_returns_items_and_cursor() {
    let (server, client) = setup().await;

    mount_delta_single_page(
        &server,
        serde_json::json!([
            file_item_json("ITEM1", "a.txt", 5, "E1"),
            { "id": "GONE", "name": "old.txt", "deleted": {} }
        ]),
        "cursor-001",
    )
    .await;

    let batch = client.delta(None).await.unwrap();
    assert_eq!(batch.items.len(), 2);
    assert!(batch.items[0].is_file());
    assert!(batch.items[1].is_deleted());
    assert_eq!(batch.cursor.as_str(), "cursor-001");
}

#[tokio::test]
async fn test_delta_with_cursor_sends_token() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "cursor-001"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [],
            "@odata.deltaLink": format!(
                "{}/me/drive/root/delta?token=cursor-002",
                server.uri()
            )
        })))
        .mount(&server)
        .await;

    let cursor = DeltaCursor::new("cursor-001").unwrap();
    let batch = client.delta(Some(&cursor)).await.unwrap();
    assert!(batch.items.is_empty());
    assert_eq!(batch.cursor.as_str(), "cursor-002");
}

#[tokio::test]
async fn test_delta_drains_pages() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("P1", "p1.txt", 1, "E1")],
            "@odata.nextLink": format!("{}/delta-page-2", server.uri())
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/delta-page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("P2", "p2.txt", 2, "E2")],
            "@odata.deltaLink": format!(
                "{}/me/drive/root/delta?token=after-pages",
                server.uri()
            )
        })))
        .mount(&server)
        .await;

    let batch = client.delta(None).await.unwrap();
    assert_eq!(batch.items.len(), 2);
    assert_eq!(batch.cursor.as_str(), "after-pages");
}

#[tokio::test]
async fn test_expired_cursor_triggers_full_resync() {
    let (server, client) = setup().await;

    // the stale cursor comes back 410 Gone
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .and(query_param("token", "stale"))
        .respond_with(ResponseTemplate::new(410).set_body_string("resyncRequired"))
        .mount(&server)
        .await;

    // the tokenless resync succeeds
    Mock::given(method("GET"))
        .and(path("/me/drive/root/delta"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "value": [file_item_json("FRESH", "fresh.txt", 1, "E1")],
            "@odata.deltaLink": format!(
                "{}/me/drive/root/delta?token=fresh-cursor",
                server.uri()
            )
        })))
        .mount(&server)
        .await;

    let stale = DeltaCursor::new("stale").unwrap();
    let batch = client.delta(Some(&stale)).await.unwrap();
    assert_eq!(batch.items.len(), 1);
    assert_eq!(batch.cursor.as_str(), "fresh-cursor");
}
