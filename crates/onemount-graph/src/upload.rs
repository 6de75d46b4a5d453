//! Upload operations
//!
//! Two delivery paths to the service:
//! - [`upload_small`] - single PUT for content below the small-upload
//!   threshold, with optional ETag precondition
//! - [`start_chunked_upload`] / [`put_chunk`] / [`cancel_chunked_upload`] -
//!   resumable session protocol driven chunk by chunk by the upload manager,
//!   which persists `next_offset` between chunks

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;

use onemount_core::domain::{DriveItem, RemoteError, UploadEndpoint};
use onemount_core::ports::{ChunkOutcome, UploadTarget};

use crate::client::{check_status, decode_json, map_transport_error, DriveClient};

/// Response from creating an upload session.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSessionResponse {
    upload_url: String,
    expiration_date_time: Option<DateTime<Utc>>,
}

/// Intermediate chunk acknowledgement.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChunkAck {
    #[serde(default)]
    next_expected_ranges: Vec<String>,
}

/// Builds the content-addressing path for a target.
fn target_path(target: &UploadTarget, suffix: &str) -> String {
    match target {
        UploadTarget::Existing(id) => format!("/me/drive/items/{}/{suffix}", id.as_str()),
        UploadTarget::NewChild { parent_id, name } => {
            if parent_id.is_root() {
                format!("/me/drive/root:/{name}:/{suffix}")
            } else {
                format!("/me/drive/items/{}:/{name}:/{suffix}", parent_id.as_str())
            }
        }
    }
}

/// Uploads content below the small-upload threshold in a single PUT.
///
/// `if_match` carries the ETag the local edit was based on; a 412 from the
/// service surfaces as `RemoteError::Conflict` and triggers the conflict
/// policy upstream.
pub async fn upload_small(
    client: &DriveClient,
    target: &UploadTarget,
    bytes: &[u8],
    if_match: Option<&str>,
) -> Result<DriveItem, RemoteError> {
    let path = target_path(target, "content");
    debug!(path = %path, len = bytes.len(), "small upload");

    let base = client.base_url().to_string();
    let body = bytes.to_vec();
    let etag = if_match.map(str::to_string);
    let response = client
        .send(move |http, token| {
            let mut req = http
                .request(Method::PUT, format!("{base}{path}"))
                .bearer_auth(token)
                .header("Content-Type", "application/octet-stream")
                .body(body.clone());
            if let Some(ref etag) = etag {
                req = req.header("If-Match", etag);
            }
            req
        })
        .await?;
    decode_json(response).await
}

/// Opens a resumable chunked upload session.
pub async fn start_chunked_upload(
    client: &DriveClient,
    target: &UploadTarget,
) -> Result<UploadEndpoint, RemoteError> {
    let path = target_path(target, "createUploadSession");
    debug!(path = %path, "creating upload session");

    let base = client.base_url().to_string();
    let response = client
        .send(move |http, token| {
            http.request(Method::POST, format!("{base}{path}"))
                .bearer_auth(token)
                .header("Content-Type", "application/json")
                .body("{}")
        })
        .await?;
    let session: UploadSessionResponse = decode_json(response).await?;

    Ok(UploadEndpoint {
        url: session.upload_url,
        expires_at: session.expiration_date_time,
    })
}

/// Uploads one chunk to a session endpoint.
///
/// The endpoint URL is pre-authenticated; chunks carry no bearer token, only
/// the `Content-Range` describing `offset..offset+len` of `total`.
pub async fn put_chunk(
    client: &DriveClient,
    endpoint: &UploadEndpoint,
    offset: u64,
    total: u64,
    bytes: &[u8],
) -> Result<ChunkOutcome, RemoteError> {
    let range_end = offset + bytes.len() as u64 - 1;
    let content_range = format!("bytes {offset}-{range_end}/{total}");
    debug!(range = %content_range, "uploading chunk");

    let response = client
        .http()
        .put(&endpoint.url)
        .header("Content-Length", bytes.len().to_string())
        .header("Content-Range", &content_range)
        .body(bytes.to_vec())
        .send()
        .await
        .map_err(map_transport_error)?;

    let status = response.status();
    let response = check_status(response).await?;

    if status == StatusCode::OK || status == StatusCode::CREATED {
        let item: DriveItem = decode_json(response).await?;
        debug!(item = %item.id, "upload session complete");
        return Ok(ChunkOutcome::Complete(Box::new(item)));
    }

    // 202 Accepted carries the next expected range
    let ack: ChunkAck = decode_json(response).await?;
    let next_offset = ack
        .next_expected_ranges
        .first()
        .and_then(|r| parse_range_start(r))
        .unwrap_or(range_end + 1);
    Ok(ChunkOutcome::Accepted { next_offset })
}

/// Abandons a chunked upload session.
pub async fn cancel_chunked_upload(
    client: &DriveClient,
    endpoint: &UploadEndpoint,
) -> Result<(), RemoteError> {
    let response = client
        .http()
        .delete(&endpoint.url)
        .send()
        .await
        .map_err(map_transport_error)?;
    check_status(response).await?;
    Ok(())
}

/// Parses the start of a `"start-end"` or `"start-"` range expression.
fn parse_range_start(range: &str) -> Option<u64> {
    range.split('-').next()?.trim().parse().ok()
}
