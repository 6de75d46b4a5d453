//! Delta queries for incremental synchronization
//!
//! Implements the service's delta pattern: an initial query (no cursor)
//! enumerates the full drive; subsequent queries with the saved cursor
//! return only what changed. Pages are drained transparently and the cursor
//! embedded in the final page's delta link is extracted for persistence.

use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, warn};

use onemount_core::domain::{DeltaCursor, DriveItem, RemoteError};
use onemount_core::ports::DeltaBatch;

use crate::client::{decode_json, DriveClient};

/// Path for the delta endpoint relative to the service base URL.
const DELTA_PATH: &str = "/me/drive/root/delta";

/// Raw response from the delta endpoint.
#[derive(Debug, Deserialize)]
struct DeltaPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

/// Queries all changes since `cursor`, draining every page.
///
/// A `410 Gone` means the cursor has expired server-side; the query restarts
/// once from scratch so the caller transparently receives a full resync
/// batch with a fresh cursor.
pub async fn delta(
    client: &DriveClient,
    cursor: Option<&DeltaCursor>,
) -> Result<DeltaBatch, RemoteError> {
    match delta_once(client, cursor).await {
        Err(RemoteError::NotFound(detail)) if cursor.is_some() => {
            warn!(detail = %detail, "delta cursor expired, performing full resync");
            delta_once(client, None).await
        }
        other => other,
    }
}

async fn delta_once(
    client: &DriveClient,
    cursor: Option<&DeltaCursor>,
) -> Result<DeltaBatch, RemoteError> {
    let path = match cursor {
        Some(c) => format!("{DELTA_PATH}?token={}", c.as_str()),
        None => DELTA_PATH.to_string(),
    };

    debug!(has_cursor = cursor.is_some(), "starting delta query");

    let mut page: DeltaPage = client.get_json(&path).await?;
    let mut items = std::mem::take(&mut page.value);
    let mut page_count: u32 = 1;

    while let Some(next) = page.next_link.take() {
        page_count += 1;
        debug!(page = page_count, "following delta nextLink");
        let response = client
            .send(move |http, token| {
                http.request(Method::GET, next.clone()).bearer_auth(token)
            })
            .await?;
        page = decode_json(response).await?;
        items.append(&mut page.value);
    }

    let delta_link = page.delta_link.ok_or_else(|| {
        RemoteError::Malformed("delta response ended without a delta link".to_string())
    })?;
    let cursor = extract_cursor(&delta_link).ok_or_else(|| {
        RemoteError::Malformed(format!("delta link carries no token: {delta_link}"))
    })?;

    debug!(
        total_items = items.len(),
        total_pages = page_count,
        "delta query complete"
    );

    Ok(DeltaBatch { items, cursor })
}

/// Extracts the cursor token from a delta link URL.
fn extract_cursor(delta_link: &str) -> Option<DeltaCursor> {
    let parsed = url::Url::parse(delta_link).ok()?;
    let token = parsed
        .query_pairs()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.into_owned())?;
    DeltaCursor::new(token).ok()
}
