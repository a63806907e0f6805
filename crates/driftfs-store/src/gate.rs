//! Global request-parallelism gates.
//!
//! Two semaphores cap how many backend requests run at once across the
//! whole mount: one for small actions (head, list, delete, whole-object
//! put, copy, multipart bookkeeping) and one for bulk actions (ranged gets
//! and multipart part bodies). Without the split, a burst of part uploads
//! can starve the cheap metadata requests interactive operations depend on.

use std::ops::Range;
use std::sync::Arc;

use driftfs_core::config::GateConfig;
use driftfs_core::domain::{Etag, ObjectKey, UploadId};
use driftfs_core::ports::{
    Capabilities, GetBlobOutput, GetBlobRequest, HeadBlobOutput, ListBlobsOutput,
    ListBlobsRequest, Metadata, MultipartPart, ObjectBackend, PutBlobOutput, PutBlobRequest,
    StoreError, UploadListing,
};
use tokio::sync::Semaphore;

/// Which gate an operation queues on.
enum Gate {
    Small,
    Bulk,
}

/// Wraps a backend so every request holds a permit from the appropriate
/// gate for its duration.
pub struct GatedBackend<B> {
    inner: B,
    small: Arc<Semaphore>,
    bulk: Arc<Semaphore>,
}

impl<B: ObjectBackend> GatedBackend<B> {
    pub fn new(inner: B, config: &GateConfig) -> Self {
        Self {
            inner,
            small: Arc::new(Semaphore::new(config.small_ops.max(1))),
            bulk: Arc::new(Semaphore::new(config.bulk_ops.max(1))),
        }
    }

    /// Access to the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    async fn permit(&self, gate: Gate) -> tokio::sync::SemaphorePermit<'_> {
        let semaphore = match gate {
            Gate::Small => &self.small,
            Gate::Bulk => &self.bulk,
        };
        // The semaphores are never closed while the backend is alive.
        semaphore
            .acquire()
            .await
            .expect("throttle gate semaphore closed")
    }
}

#[async_trait::async_trait]
impl<B: ObjectBackend> ObjectBackend for GatedBackend<B> {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn head_blob(&self, key: &ObjectKey) -> Result<HeadBlobOutput, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.head_blob(key).await
    }

    async fn list_blobs(&self, request: &ListBlobsRequest) -> Result<ListBlobsOutput, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.list_blobs(request).await
    }

    async fn get_blob(&self, request: &GetBlobRequest) -> Result<GetBlobOutput, StoreError> {
        let _permit = self.permit(Gate::Bulk).await;
        self.inner.get_blob(request).await
    }

    async fn put_blob(&self, request: PutBlobRequest) -> Result<PutBlobOutput, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.put_blob(request).await
    }

    async fn copy_blob(
        &self,
        src: &ObjectKey,
        dst: &ObjectKey,
        metadata: Option<&Metadata>,
    ) -> Result<Etag, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.copy_blob(src, dst, metadata).await
    }

    async fn delete_blobs(&self, keys: &[ObjectKey]) -> Result<(), StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.delete_blobs(keys).await
    }

    async fn rename_blob(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<(), StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.rename_blob(src, dst).await
    }

    async fn multipart_begin(
        &self,
        key: &ObjectKey,
        metadata: &Metadata,
    ) -> Result<UploadId, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.multipart_begin(key, metadata).await
    }

    async fn multipart_add(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<Etag, StoreError> {
        let _permit = self.permit(Gate::Bulk).await;
        self.inner.multipart_add(key, upload, part_number, data).await
    }

    async fn multipart_copy(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        src: &ObjectKey,
        range: Option<Range<u64>>,
    ) -> Result<Etag, StoreError> {
        let _permit = self.permit(Gate::Bulk).await;
        self.inner
            .multipart_copy(key, upload, part_number, src, range)
            .await
    }

    async fn multipart_commit(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        parts: &[MultipartPart],
    ) -> Result<PutBlobOutput, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.multipart_commit(key, upload, parts).await
    }

    async fn multipart_abort(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
    ) -> Result<(), StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.multipart_abort(key, upload).await
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
    ) -> Result<Vec<UploadListing>, StoreError> {
        let _permit = self.permit(Gate::Small).await;
        self.inner.list_multipart_uploads(prefix).await
    }
}
