//! `IRemoteClient` port implementation
//!
//! Binds the endpoint modules onto the port trait the engine consumes, so
//! everything above the graph crate can be exercised against a mock.

use tokio::io::AsyncWrite;

use onemount_core::domain::{DeltaCursor, DriveItem, ItemId, RemoteError, UploadEndpoint};
use onemount_core::ports::{ChunkOutcome, DeltaBatch, DriveQuota, IRemoteClient, UploadTarget};

use crate::client::DriveClient;
use crate::{delta, items, upload};

#[async_trait::async_trait]
impl IRemoteClient for DriveClient {
    async fn get_item(&self, id: &ItemId) -> Result<DriveItem, RemoteError> {
        items::get_item(self, id).await
    }

    async fn get_item_by_path(&self, path: &str) -> Result<DriveItem, RemoteError> {
        items::get_item_by_path(self, path).await
    }

    async fn get_child(&self, parent_id: &ItemId, name: &str) -> Result<DriveItem, RemoteError> {
        items::get_child(self, parent_id, name).await
    }

    async fn list_children(&self, parent_id: &ItemId) -> Result<Vec<DriveItem>, RemoteError> {
        items::list_children(self, parent_id).await
    }

    async fn create_folder(
        &self,
        parent_id: &ItemId,
        name: &str,
        conflict_behavior: &str,
    ) -> Result<DriveItem, RemoteError> {
        items::create_folder(self, parent_id, name, conflict_behavior).await
    }

    async fn delete(&self, id: &ItemId) -> Result<(), RemoteError> {
        items::delete(self, id).await
    }

    async fn rename_move(
        &self,
        id: &ItemId,
        new_parent_id: &ItemId,
        new_name: &str,
    ) -> Result<DriveItem, RemoteError> {
        items::rename_move(self, id, new_parent_id, new_name).await
    }

    async fn download(
        &self,
        id: &ItemId,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, RemoteError> {
        items::download(self, id, sink).await
    }

    async fn upload_small(
        &self,
        target: &UploadTarget,
        bytes: &[u8],
        if_match: Option<&str>,
    ) -> Result<DriveItem, RemoteError> {
        upload::upload_small(self, target, bytes, if_match).await
    }

    async fn start_chunked_upload(
        &self,
        target: &UploadTarget,
    ) -> Result<UploadEndpoint, RemoteError> {
        upload::start_chunked_upload(self, target).await
    }

    async fn put_chunk(
        &self,
        endpoint: &UploadEndpoint,
        offset: u64,
        total: u64,
        bytes: &[u8],
    ) -> Result<ChunkOutcome, RemoteError> {
        upload::put_chunk(self, endpoint, offset, total, bytes).await
    }

    async fn cancel_chunked_upload(&self, endpoint: &UploadEndpoint) -> Result<(), RemoteError> {
        upload::cancel_chunked_upload(self, endpoint).await
    }

    async fn delta(&self, cursor: Option<&DeltaCursor>) -> Result<DeltaBatch, RemoteError> {
        delta::delta(self, cursor).await
    }

    async fn get_drive_quota(&self) -> Result<DriveQuota, RemoteError> {
        items::get_drive_quota(self).await
    }
}
