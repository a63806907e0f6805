//! Exponential backoff over transient backend failures.
//!
//! The flusher and fetcher never retry themselves; every backend handed to
//! the pipeline is wrapped in a [`RetryingBackend`], so throttling and
//! 5xx-class failures are absorbed here and permanent errors pass straight
//! through. A cancellation token aborts waits immediately on unmount.

use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use driftfs_core::config::RetryConfig;
use driftfs_core::domain::{Etag, ObjectKey, UploadId};
use driftfs_core::metrics::MetricsRegistry;
use driftfs_core::ports::{
    Capabilities, GetBlobOutput, GetBlobRequest, HeadBlobOutput, ListBlobsOutput,
    ListBlobsRequest, Metadata, MultipartPart, ObjectBackend, PutBlobOutput, PutBlobRequest,
    StoreError, UploadListing,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Wraps a backend with retry, cancellation and request metrics.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryConfig,
    cancel: CancellationToken,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl<B: ObjectBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
            metrics: None,
        }
    }

    /// Attaches a metrics registry; request outcomes are counted under
    /// `store_requests_total`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Access to the wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Backoff delay before retry number `attempt` (zero-based), honouring
    /// any server-provided retry-after hint.
    fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let backoff = self
            .policy
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.policy.max_delay_ms);
        hint.unwrap_or(Duration::from_millis(backoff))
    }

    async fn with_retry<T, F, Fut>(
        &self,
        op: &'static str,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        let result = loop {
            if self.cancel.is_cancelled() {
                break Err(StoreError::Io(format!("{op} cancelled")));
            }
            match call().await {
                Err(err) if err.is_transient() && attempt + 1 < self.policy.max_attempts => {
                    let hint = match &err {
                        StoreError::Throttled { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.delay_for(attempt, hint);
                    debug!(op, attempt, ?delay, %err, "retrying transient backend failure");
                    attempt += 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            break Err(StoreError::Io(format!("{op} cancelled")));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(op, attempts = attempt + 1, %err, "retries exhausted");
                    }
                    break Err(err);
                }
                Ok(value) => break Ok(value),
            }
        };

        if let Some(metrics) = &self.metrics {
            let status = if result.is_ok() { "ok" } else { "error" };
            metrics
                .store_requests_total
                .with_label_values(&[op, status])
                .inc();
        }
        result
    }
}

#[async_trait::async_trait]
impl<B: ObjectBackend> ObjectBackend for RetryingBackend<B> {
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn head_blob(&self, key: &ObjectKey) -> Result<HeadBlobOutput, StoreError> {
        self.with_retry("head_blob", || self.inner.head_blob(key)).await
    }

    async fn list_blobs(&self, request: &ListBlobsRequest) -> Result<ListBlobsOutput, StoreError> {
        self.with_retry("list_blobs", || self.inner.list_blobs(request))
            .await
    }

    async fn get_blob(&self, request: &GetBlobRequest) -> Result<GetBlobOutput, StoreError> {
        self.with_retry("get_blob", || self.inner.get_blob(request))
            .await
    }

    async fn put_blob(&self, request: PutBlobRequest) -> Result<PutBlobOutput, StoreError> {
        self.with_retry("put_blob", || self.inner.put_blob(request.clone()))
            .await
    }

    async fn copy_blob(
        &self,
        src: &ObjectKey,
        dst: &ObjectKey,
        metadata: Option<&Metadata>,
    ) -> Result<Etag, StoreError> {
        self.with_retry("copy_blob", || self.inner.copy_blob(src, dst, metadata))
            .await
    }

    async fn delete_blobs(&self, keys: &[ObjectKey]) -> Result<(), StoreError> {
        self.with_retry("delete_blobs", || self.inner.delete_blobs(keys))
            .await
    }

    async fn rename_blob(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<(), StoreError> {
        self.with_retry("rename_blob", || self.inner.rename_blob(src, dst))
            .await
    }

    async fn multipart_begin(
        &self,
        key: &ObjectKey,
        metadata: &Metadata,
    ) -> Result<UploadId, StoreError> {
        self.with_retry("multipart_begin", || self.inner.multipart_begin(key, metadata))
            .await
    }

    async fn multipart_add(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<Etag, StoreError> {
        self.with_retry("multipart_add", || {
            self.inner.multipart_add(key, upload, part_number, data.clone())
        })
        .await
    }

    async fn multipart_copy(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        src: &ObjectKey,
        range: Option<Range<u64>>,
    ) -> Result<Etag, StoreError> {
        self.with_retry("multipart_copy", || {
            self.inner
                .multipart_copy(key, upload, part_number, src, range.clone())
        })
        .await
    }

    async fn multipart_commit(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        parts: &[MultipartPart],
    ) -> Result<PutBlobOutput, StoreError> {
        self.with_retry("multipart_commit", || {
            self.inner.multipart_commit(key, upload, parts)
        })
        .await
    }

    async fn multipart_abort(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
    ) -> Result<(), StoreError> {
        self.with_retry("multipart_abort", || self.inner.multipart_abort(key, upload))
            .await
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
    ) -> Result<Vec<UploadListing>, StoreError> {
        self.with_retry("list_multipart_uploads", || {
            self.inner.list_multipart_uploads(prefix)
        })
        .await
    }
}
