//! Item metadata and content operations
//!
//! Free functions over [`DriveClient`], mirroring the service's item
//! endpoints: lookups by id / path / parent+name, paged child listings,
//! folder creation, delete, rename/move, and streaming content download.

use futures_util::StreamExt;
use reqwest::Method;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use onemount_core::domain::{DriveItem, ItemId, RemoteError};
use onemount_core::ports::DriveQuota;

use crate::client::{decode_json, map_transport_error, DriveClient};

/// One page of a children listing.
#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

/// Drive metadata response, reduced to the quota facet.
#[derive(Debug, Deserialize)]
struct DriveResponse {
    quota: Option<QuotaFacet>,
}

#[derive(Debug, Deserialize)]
struct QuotaFacet {
    total: Option<u64>,
    used: Option<u64>,
}

/// Escapes an item id for use in a URL path segment.
fn id_segment(id: &ItemId) -> String {
    id.as_str().to_string()
}

/// Fetches an item by id.
pub async fn get_item(client: &DriveClient, id: &ItemId) -> Result<DriveItem, RemoteError> {
    client
        .get_json(&format!("/me/drive/items/{}", id_segment(id)))
        .await
}

/// Fetches an item by drive-root-relative path (leading `/`).
pub async fn get_item_by_path(client: &DriveClient, path: &str) -> Result<DriveItem, RemoteError> {
    if path.is_empty() || path == "/" {
        return client.get_json("/me/drive/root").await;
    }
    client
        .get_json(&format!("/me/drive/root:{path}:"))
        .await
}

/// Fetches a named child of a parent.
pub async fn get_child(
    client: &DriveClient,
    parent_id: &ItemId,
    name: &str,
) -> Result<DriveItem, RemoteError> {
    if parent_id.is_root() {
        return client.get_json(&format!("/me/drive/root:/{name}:")).await;
    }
    client
        .get_json(&format!(
            "/me/drive/items/{}:/{name}:",
            id_segment(parent_id)
        ))
        .await
}

/// Lists all children of a folder, draining paged continuations.
pub async fn list_children(
    client: &DriveClient,
    parent_id: &ItemId,
) -> Result<Vec<DriveItem>, RemoteError> {
    let first_path = if parent_id.is_root() {
        "/me/drive/root/children".to_string()
    } else {
        format!("/me/drive/items/{}/children", id_segment(parent_id))
    };

    let mut page: ChildrenPage = client.get_json(&first_path).await?;
    let mut items = std::mem::take(&mut page.value);

    // nextLink is an absolute URL, so pages after the first bypass the
    // base-URL request builder.
    while let Some(next) = page.next_link.take() {
        debug!(parent = %parent_id, "following children nextLink");
        let response = client
            .send(move |http, token| http.get(next.clone()).bearer_auth(token))
            .await?;
        page = decode_json(response).await?;
        items.append(&mut page.value);
    }

    Ok(items)
}

/// Creates a folder under a parent.
pub async fn create_folder(
    client: &DriveClient,
    parent_id: &ItemId,
    name: &str,
    conflict_behavior: &str,
) -> Result<DriveItem, RemoteError> {
    let path = if parent_id.is_root() {
        "/me/drive/root/children".to_string()
    } else {
        format!("/me/drive/items/{}/children", id_segment(parent_id))
    };
    let body = serde_json::json!({
        "name": name,
        "folder": {},
        "@microsoft.graph.conflictBehavior": conflict_behavior,
    });

    let base = client.base_url().to_string();
    let response = client
        .send(move |http, token| {
            http.request(Method::POST, format!("{base}{path}"))
                .bearer_auth(token)
                .json(&body)
        })
        .await?;
    decode_json(response).await
}

/// Deletes an item.
pub async fn delete(client: &DriveClient, id: &ItemId) -> Result<(), RemoteError> {
    let path = format!("/me/drive/items/{}", id_segment(id));
    let base = client.base_url().to_string();
    client
        .send(move |http, token| {
            http.request(Method::DELETE, format!("{base}{path}"))
                .bearer_auth(token)
        })
        .await?;
    Ok(())
}

/// Renames and/or moves an item.
pub async fn rename_move(
    client: &DriveClient,
    id: &ItemId,
    new_parent_id: &ItemId,
    new_name: &str,
) -> Result<DriveItem, RemoteError> {
    let path = format!("/me/drive/items/{}", id_segment(id));
    let body = serde_json::json!({
        "name": new_name,
        "parentReference": { "id": new_parent_id.as_str() },
    });

    let base = client.base_url().to_string();
    let response = client
        .send(move |http, token| {
            http.request(Method::PATCH, format!("{base}{path}"))
                .bearer_auth(token)
                .json(&body)
        })
        .await?;
    decode_json(response).await
}

/// Streams an item's content into `sink`, returning the byte count.
///
/// Requests `/content`, which redirects to a pre-authenticated download URL;
/// the redirect is followed automatically, and an expired URL simply
/// resolves to a fresh redirect on the next call.
pub async fn download(
    client: &DriveClient,
    id: &ItemId,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<u64, RemoteError> {
    let path = format!("/me/drive/items/{}/content", id_segment(id));
    let base = client.base_url().to_string();
    let response = client
        .send(move |http, token| {
            http.request(Method::GET, format!("{base}{path}"))
                .bearer_auth(token)
        })
        .await?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_transport_error)?;
        sink.write_all(&chunk)
            .await
            .map_err(|e| RemoteError::Internal(format!("sink write failed: {e}")))?;
        written += chunk.len() as u64;
    }
    sink.flush()
        .await
        .map_err(|e| RemoteError::Internal(format!("sink flush failed: {e}")))?;

    debug!(item = %id, bytes = written, "download complete");
    Ok(written)
}

/// Fetches the drive quota aggregate for `statfs`.
pub async fn get_drive_quota(client: &DriveClient) -> Result<DriveQuota, RemoteError> {
    let drive: DriveResponse = client.get_json("/me/drive").await?;
    let quota = drive.quota.unwrap_or(QuotaFacet {
        total: None,
        used: None,
    });
    Ok(DriveQuota {
        total: quota.total.unwrap_or(0),
        used: quota.used.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_page_deserialization() {
        let json = r#"{
            "value": [
                {"id": "A1", "name": "a.txt", "size": 5, "file": {}},
                {"id": "B2", "name": "sub", "folder": {"childCount": 0}}
            ],
            "@odata.nextLink": "https://example.test/page2"
        }"#;
        let page: ChildrenPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.value.len(), 2);
        assert!(page.value[0].is_file());
        assert!(page.value[1].is_dir());
        assert_eq!(page.next_link.as_deref(), Some("https://example.test/page2"));
    }

    #[test]
    fn test_drive_quota_deserialization() {
        let json = r#"{"id": "d1", "quota": {"total": 100, "used": 25, "remaining": 75}}"#;
        let drive: DriveResponse = serde_json::from_str(json).unwrap();
        let q = drive.quota.unwrap();
        assert_eq!(q.total, Some(100));
        assert_eq!(q.used, Some(25));
    }

    #[test]
    fn test_drive_quota_missing() {
        let json = r#"{"id": "d1"}"#;
        let drive: DriveResponse = serde_json::from_str(json).unwrap();
        assert!(drive.quota.is_none());
    }
}
