//! Object-store port (driven/secondary port)
//!
//! This module defines the uniform interface the core consumes from object
//! storage drivers (S3-compatible services, Azure Blob, GCS, an on-disk
//! store). Drivers live outside the core; the in-memory reference
//! implementation used by the test suites lives in `driftfs-store`.
//!
//! ## Design notes
//!
//! - Every operation is a suspension point; implementations must be safe to
//!   call concurrently and never hold core locks.
//! - Errors carry a transient/permanent split: the flusher and fetcher retry
//!   transient failures with backoff, permanent failures propagate.
//! - `Capabilities` describes what the driver can do (server-side rename,
//!   multipart limits, directory-marker scheme) so the core can pick code
//!   paths without downcasting.

use std::collections::BTreeMap;
use std::ops::Range;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::errors::FsError;
use crate::domain::newtypes::{Etag, ObjectKey, UploadId};

/// String metadata attached to an object. Keys are treated
/// case-insensitively; the core normalises them to lowercase.
pub type Metadata = BTreeMap<String, String>;

// ============================================================================
// StoreError
// ============================================================================

/// Errors returned by object-store drivers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    Permission(String),

    /// Backend asked us to slow down (HTTP 429/503 class).
    #[error("throttled by backend")]
    Throttled { retry_after: Option<Duration> },

    /// Transient failure (5xx class, connection reset). Retryable.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Conditional request failed (HTTP 412). The cached etag is stale;
    /// readers discard it and retry.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not supported by backend: {0}")]
    NotSupported(&'static str),

    #[error("entity too large: {0}")]
    TooLarge(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    /// Transport failure that is not known to be retryable.
    #[error("I/O failure: {0}")]
    Io(String),
}

impl StoreError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Throttled { .. } | StoreError::Transient(_)
        )
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => FsError::NotFound(m),
            StoreError::Permission(m) => FsError::Permission(m),
            StoreError::Throttled { .. } => FsError::Busy("backend throttling".to_string()),
            StoreError::Transient(m) => FsError::Busy(m),
            StoreError::PreconditionFailed(m) => FsError::Busy(m),
            StoreError::NotSupported(m) => FsError::NotSupported(m.to_string()),
            StoreError::TooLarge(m) => FsError::TooLarge(m),
            StoreError::Invalid(m) => FsError::Invalid(m),
            StoreError::Io(m) => FsError::Io(m),
        }
    }
}

// ============================================================================
// Capabilities
// ============================================================================

/// How a backend represents an empty directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirMarkerScheme {
    /// Directories exist only as common prefixes of keys; empty directories
    /// cannot be represented and live purely in memory.
    None,
    /// A zero-byte blob whose key carries a trailing `/`.
    EmptyBlob,
    /// A blob flagged as a directory via backend-specific metadata.
    MetadataFlag,
}

/// Static description of what a backend driver can do.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// Smallest allowed multipart part size, except for the final part.
    pub min_part_size: u64,
    /// Largest allowed multipart part size.
    pub max_part_size: u64,
    /// Maximum number of parts in one upload.
    pub max_parts: u32,
    /// Whether `rename_blob` works server-side.
    pub supports_rename: bool,
    /// Whether `multipart_copy` can build parts from an existing object.
    /// Without it, a restarted upload re-sends unchanged ranges.
    pub supports_part_copy: bool,
    /// How empty directories are persisted.
    pub dir_markers: DirMarkerScheme,
    /// Whether listings come back lexicographically sorted. The core
    /// re-sorts when this is false.
    pub sorted_listing: bool,
    /// Maximum number of keys accepted by one `delete_blobs` call.
    pub max_delete_batch: usize,
    /// Whether a server-side copy preserves the source etag.
    pub copy_preserves_etag: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        // The S3 baseline.
        Self {
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 5 * 1024 * 1024 * 1024,
            max_parts: 10_000,
            supports_rename: false,
            supports_part_copy: true,
            dir_markers: DirMarkerScheme::EmptyBlob,
            sorted_listing: true,
            max_delete_batch: 1000,
            copy_preserves_etag: false,
        }
    }
}

// ============================================================================
// Request / response DTOs
// ============================================================================

/// Output of a `head_blob` probe.
#[derive(Debug, Clone)]
pub struct HeadBlobOutput {
    pub size: u64,
    pub etag: Etag,
    pub mtime: DateTime<Utc>,
    pub metadata: Metadata,
    pub storage_class: Option<String>,
    /// True when the blob is a directory marker under the backend's scheme.
    pub is_directory_marker: bool,
}

/// A paged prefix listing request.
#[derive(Debug, Clone)]
pub struct ListBlobsRequest {
    pub prefix: String,
    /// With `Some('/')` the backend groups keys below the first separator
    /// into `common_prefixes`.
    pub delimiter: Option<char>,
    pub continuation: Option<String>,
    pub max_keys: usize,
}

/// One object in a listing page. Listings do not carry user metadata.
#[derive(Debug, Clone)]
pub struct BlobItem {
    pub key: ObjectKey,
    pub size: u64,
    pub etag: Etag,
    pub mtime: DateTime<Utc>,
    pub storage_class: Option<String>,
}

/// One page of a prefix listing.
#[derive(Debug, Clone)]
pub struct ListBlobsOutput {
    pub items: Vec<BlobItem>,
    pub common_prefixes: Vec<String>,
    pub next_continuation: Option<String>,
}

/// A ranged, optionally conditional read.
#[derive(Debug, Clone)]
pub struct GetBlobRequest {
    pub key: ObjectKey,
    /// Byte range to read; `None` reads the whole object.
    pub range: Option<Range<u64>>,
    /// When set, the read fails with `PreconditionFailed` if the object's
    /// current etag differs.
    pub if_match: Option<Etag>,
}

/// Output of a (ranged) read.
#[derive(Debug, Clone)]
pub struct GetBlobOutput {
    pub data: Vec<u8>,
    pub etag: Etag,
    pub metadata: Metadata,
}

/// A whole-object write.
#[derive(Debug, Clone)]
pub struct PutBlobRequest {
    pub key: ObjectKey,
    pub data: Vec<u8>,
    pub metadata: Metadata,
    pub content_type: Option<String>,
}

/// Output of a write, copy commit or multipart commit.
#[derive(Debug, Clone)]
pub struct PutBlobOutput {
    pub etag: Etag,
    pub mtime: DateTime<Utc>,
}

/// One committed part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    pub number: u32,
    pub etag: Etag,
}

/// One in-flight multipart upload, as returned by the startup reaper scan.
#[derive(Debug, Clone)]
pub struct UploadListing {
    pub key: ObjectKey,
    pub upload_id: UploadId,
    pub metadata: Metadata,
}

// ============================================================================
// ObjectBackend trait
// ============================================================================

/// Uniform object-store interface consumed by the core.
///
/// Implementations map driver-native failures into [`StoreError`], keeping
/// the transient/permanent split intact so the retry layer can do its job.
/// Part numbers passed to the multipart group are strictly monotonic per
/// upload; implementations may reject violations with `Invalid`.
#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Static capability record for this driver.
    fn capabilities(&self) -> Capabilities;

    /// Fetches object metadata without the body.
    async fn head_blob(&self, key: &ObjectKey) -> Result<HeadBlobOutput, StoreError>;

    /// Lists one page of keys under a prefix.
    async fn list_blobs(&self, request: &ListBlobsRequest) -> Result<ListBlobsOutput, StoreError>;

    /// Reads an object, optionally ranged and conditional on etag.
    async fn get_blob(&self, request: &GetBlobRequest) -> Result<GetBlobOutput, StoreError>;

    /// Writes a whole object, replacing any previous version.
    async fn put_blob(&self, request: PutBlobRequest) -> Result<PutBlobOutput, StoreError>;

    /// Server-side copy. Metadata is replaced when `metadata` is `Some`,
    /// carried over otherwise. May block until the copy completes.
    async fn copy_blob(
        &self,
        src: &ObjectKey,
        dst: &ObjectKey,
        metadata: Option<&Metadata>,
    ) -> Result<Etag, StoreError>;

    /// Deletes a batch of keys. Keys that do not exist are ignored.
    /// Callers keep batches within `Capabilities::max_delete_batch`.
    async fn delete_blobs(&self, keys: &[ObjectKey]) -> Result<(), StoreError>;

    /// Server-side rename, where the driver supports it.
    async fn rename_blob(&self, _src: &ObjectKey, _dst: &ObjectKey) -> Result<(), StoreError> {
        Err(StoreError::NotSupported("rename_blob"))
    }

    /// Starts a multipart upload and returns its id.
    async fn multipart_begin(
        &self,
        key: &ObjectKey,
        metadata: &Metadata,
    ) -> Result<UploadId, StoreError>;

    /// Uploads one part. Parts except the last must be at least
    /// `Capabilities::min_part_size` bytes.
    async fn multipart_add(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<Etag, StoreError>;

    /// Server-side copy of a byte range of an existing object into a part.
    async fn multipart_copy(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        src: &ObjectKey,
        range: Option<Range<u64>>,
    ) -> Result<Etag, StoreError>;

    /// Atomically assembles the uploaded parts into the final object.
    async fn multipart_commit(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        parts: &[MultipartPart],
    ) -> Result<PutBlobOutput, StoreError>;

    /// Discards an upload and its parts.
    async fn multipart_abort(&self, key: &ObjectKey, upload: &UploadId)
        -> Result<(), StoreError>;

    /// Lists in-flight multipart uploads under a prefix, for the startup
    /// reaper.
    async fn list_multipart_uploads(&self, prefix: &str)
        -> Result<Vec<UploadListing>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Throttled { retry_after: None }.is_transient());
        assert!(StoreError::Transient("connection reset".to_string()).is_transient());
        assert!(!StoreError::NotFound("k".to_string()).is_transient());
        assert!(!StoreError::Permission("k".to_string()).is_transient());
        assert!(!StoreError::PreconditionFailed("etag".to_string()).is_transient());
    }

    #[test]
    fn test_store_error_to_fs_error() {
        let err: FsError = StoreError::NotFound("a.txt".to_string()).into();
        assert!(matches!(err, FsError::NotFound(_)));

        let err: FsError = StoreError::Throttled { retry_after: None }.into();
        assert!(matches!(err, FsError::Busy(_)));

        let err: FsError = StoreError::NotSupported("rename_blob").into();
        assert!(matches!(err, FsError::NotSupported(_)));
    }

    #[test]
    fn test_default_capabilities_are_s3_shaped() {
        let caps = Capabilities::default();
        assert_eq!(caps.min_part_size, 5 * 1024 * 1024);
        assert_eq!(caps.max_parts, 10_000);
        assert!(!caps.supports_rename);
        assert!(caps.supports_part_copy);
        assert_eq!(caps.dir_markers, DirMarkerScheme::EmptyBlob);
    }
}
