//! In-memory reference backend.
//!
//! Implements the full [`ObjectBackend`] contract against a sorted in-memory
//! key space. The test suites of every other crate drive the pipeline
//! against this backend, so it mirrors real object-store semantics closely:
//! paged and delimiter-grouped listings, ranged and conditional reads,
//! multipart sessions with part-size validation at commit, and the
//! `"<hash>-<parts>"` etag shape for multipart objects.
//!
//! Faults can be injected per operation to exercise the retry and
//! failure-recovery paths without a network.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use driftfs_core::domain::{Etag, ObjectKey, UploadId};
use driftfs_core::ports::{
    BlobItem, Capabilities, DirMarkerScheme, GetBlobOutput, GetBlobRequest, HeadBlobOutput,
    ListBlobsOutput, ListBlobsRequest, Metadata, MultipartPart, ObjectBackend, PutBlobOutput,
    PutBlobRequest, StoreError, UploadListing,
};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One stored object.
#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: Etag,
    mtime: DateTime<Utc>,
    metadata: Metadata,
    storage_class: Option<String>,
}

/// One in-flight multipart session.
#[derive(Debug, Default)]
struct UploadSession {
    key: String,
    metadata: Metadata,
    /// part number -> (etag, bytes)
    parts: BTreeMap<u32, (Etag, Vec<u8>)>,
}

/// In-memory object store with injectable faults.
pub struct MemoryBackend {
    caps: Capabilities,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, UploadSession>>,
    /// Scripted outcomes per operation: `Some(err)` fails the call,
    /// `None` lets it through (to target a later call).
    faults: Mutex<HashMap<&'static str, VecDeque<Option<StoreError>>>>,
    op_counts: Mutex<HashMap<&'static str, u64>>,
}

impl MemoryBackend {
    /// An empty store with S3-shaped default capabilities.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    /// An empty store with an explicit capability profile, for exercising
    /// rename tiers and marker schemes.
    pub fn with_capabilities(caps: Capabilities) -> Self {
        Self {
            caps,
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            op_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Queues `error` to be returned by the next call of `op`.
    /// Repeated calls queue repeated failures.
    pub fn inject_fault(&self, op: &'static str, error: StoreError) {
        self.faults
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(Some(error));
    }

    /// Queues one successful call of `op` ahead of any queued fault, so a
    /// failure can target the n-th call.
    pub fn inject_ok(&self, op: &'static str) {
        self.faults
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(None);
    }

    /// Number of completed calls of `op`, including failed ones.
    pub fn op_count(&self, op: &str) -> u64 {
        self.op_counts.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    /// Test helper: raw bytes of a stored object.
    pub fn object_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.data.clone())
    }

    /// Test helper: all stored keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// Test helper: whether `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// Test helper: number of multipart sessions still open.
    pub fn open_uploads(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }

    fn enter(&self, op: &'static str) -> Result<(), StoreError> {
        *self.op_counts.lock().unwrap().entry(op).or_insert(0) += 1;
        if let Some(queue) = self.faults.lock().unwrap().get_mut(op) {
            if let Some(Some(err)) = queue.pop_front() {
                return Err(err);
            }
        }
        Ok(())
    }

    fn content_etag(data: &[u8]) -> Etag {
        let digest = Sha256::digest(data);
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{:02x}", byte));
        }
        Etag::new(hex)
    }

    /// S3-style multipart etag: hash of the part etags plus a part count.
    fn multipart_etag(parts: &[&Etag]) -> Etag {
        let mut hasher = Sha256::new();
        for etag in parts {
            hasher.update(etag.as_str().as_bytes());
        }
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(32);
        for byte in &digest[..16] {
            hex.push_str(&format!("{:02x}", byte));
        }
        Etag::new(format!("{}-{}", hex, parts.len()))
    }

    fn is_marker(&self, key: &str, metadata: &Metadata) -> bool {
        match self.caps.dir_markers {
            DirMarkerScheme::None => false,
            DirMarkerScheme::EmptyBlob => key.ends_with('/'),
            DirMarkerScheme::MetadataFlag => {
                metadata.get("hdi_isfolder").map(String::as_str) == Some("true")
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ObjectBackend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn head_blob(&self, key: &ObjectKey) -> Result<HeadBlobOutput, StoreError> {
        self.enter("head_blob")?;
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(key.as_str())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(HeadBlobOutput {
            size: object.data.len() as u64,
            etag: object.etag.clone(),
            mtime: object.mtime,
            metadata: object.metadata.clone(),
            storage_class: object.storage_class.clone(),
            is_directory_marker: self.is_marker(key.as_str(), &object.metadata),
        })
    }

    async fn list_blobs(&self, request: &ListBlobsRequest) -> Result<ListBlobsOutput, StoreError> {
        self.enter("list_blobs")?;
        let objects = self.objects.lock().unwrap();

        let mut items = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut next_continuation = None;
        let mut last_emitted = String::new();

        let after = request.continuation.as_deref().unwrap_or("");
        for (key, object) in objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }

            // Derive the entry this key contributes: either a grouped
            // common prefix or the key itself.
            let remainder = &key[request.prefix.len()..];
            let grouped = request
                .delimiter
                .and_then(|delim| remainder.find(delim))
                .map(|pos| format!("{}{}", request.prefix, &remainder[..=pos]));
            let entry_name = grouped.as_deref().unwrap_or(key.as_str());

            if entry_name <= after || prefixes.last().map(String::as_str) == Some(entry_name) {
                continue;
            }
            if items.len() + prefixes.len() >= request.max_keys {
                next_continuation = Some(last_emitted);
                break;
            }
            last_emitted = entry_name.to_string();

            match grouped {
                Some(prefix) => prefixes.push(prefix),
                None => items.push(BlobItem {
                    key: ObjectKey::new(key.clone())
                        .map_err(|e| StoreError::Invalid(e.to_string()))?,
                    size: object.data.len() as u64,
                    etag: object.etag.clone(),
                    mtime: object.mtime,
                    storage_class: object.storage_class.clone(),
                }),
            }
        }

        Ok(ListBlobsOutput {
            items,
            common_prefixes: prefixes,
            next_continuation,
        })
    }

    async fn get_blob(&self, request: &GetBlobRequest) -> Result<GetBlobOutput, StoreError> {
        self.enter("get_blob")?;
        let objects = self.objects.lock().unwrap();
        let object = objects
            .get(request.key.as_str())
            .ok_or_else(|| StoreError::NotFound(request.key.to_string()))?;

        if let Some(expected) = &request.if_match {
            if *expected != object.etag {
                return Err(StoreError::PreconditionFailed(request.key.to_string()));
            }
        }

        let data = match &request.range {
            None => object.data.clone(),
            Some(range) => {
                if range.start > object.data.len() as u64 {
                    return Err(StoreError::Invalid(format!(
                        "range start {} beyond object size {}",
                        range.start,
                        object.data.len()
                    )));
                }
                let end = range.end.min(object.data.len() as u64);
                object.data[range.start as usize..end as usize].to_vec()
            }
        };

        Ok(GetBlobOutput {
            data,
            etag: object.etag.clone(),
            metadata: object.metadata.clone(),
        })
    }

    async fn put_blob(&self, request: PutBlobRequest) -> Result<PutBlobOutput, StoreError> {
        self.enter("put_blob")?;
        let etag = Self::content_etag(&request.data);
        let mtime = Utc::now();
        self.objects.lock().unwrap().insert(
            request.key.to_string(),
            StoredObject {
                data: request.data,
                etag: etag.clone(),
                mtime,
                metadata: request.metadata,
                storage_class: None,
            },
        );
        Ok(PutBlobOutput { etag, mtime })
    }

    async fn copy_blob(
        &self,
        src: &ObjectKey,
        dst: &ObjectKey,
        metadata: Option<&Metadata>,
    ) -> Result<Etag, StoreError> {
        self.enter("copy_blob")?;
        let mut objects = self.objects.lock().unwrap();
        let mut copy = objects
            .get(src.as_str())
            .ok_or_else(|| StoreError::NotFound(src.to_string()))?
            .clone();
        if let Some(metadata) = metadata {
            copy.metadata = metadata.clone();
        }
        if !self.caps.copy_preserves_etag {
            // Same bytes, new object version.
            copy.etag = Self::content_etag(&copy.data);
            copy.mtime = Utc::now();
        }
        let etag = copy.etag.clone();
        objects.insert(dst.to_string(), copy);
        Ok(etag)
    }

    async fn delete_blobs(&self, keys: &[ObjectKey]) -> Result<(), StoreError> {
        self.enter("delete_blobs")?;
        if keys.len() > self.caps.max_delete_batch {
            return Err(StoreError::Invalid(format!(
                "batch of {} exceeds limit {}",
                keys.len(),
                self.caps.max_delete_batch
            )));
        }
        let mut objects = self.objects.lock().unwrap();
        for key in keys {
            objects.remove(key.as_str());
        }
        Ok(())
    }

    async fn rename_blob(&self, src: &ObjectKey, dst: &ObjectKey) -> Result<(), StoreError> {
        self.enter("rename_blob")?;
        if !self.caps.supports_rename {
            return Err(StoreError::NotSupported("rename_blob"));
        }
        let mut objects = self.objects.lock().unwrap();
        let object = objects
            .remove(src.as_str())
            .ok_or_else(|| StoreError::NotFound(src.to_string()))?;
        objects.insert(dst.to_string(), object);
        Ok(())
    }

    async fn multipart_begin(
        &self,
        key: &ObjectKey,
        metadata: &Metadata,
    ) -> Result<UploadId, StoreError> {
        self.enter("multipart_begin")?;
        let id = Uuid::new_v4().to_string();
        self.uploads.lock().unwrap().insert(
            id.clone(),
            UploadSession {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(UploadId::new(id))
    }

    async fn multipart_add(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<Etag, StoreError> {
        self.enter("multipart_add")?;
        if part_number == 0 || part_number > self.caps.max_parts {
            return Err(StoreError::Invalid(format!(
                "part number {} out of range",
                part_number
            )));
        }
        let mut uploads = self.uploads.lock().unwrap();
        let session = uploads
            .get_mut(upload.as_str())
            .filter(|s| s.key == key.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("upload {upload}")))?;
        let etag = Self::content_etag(&data);
        session.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn multipart_copy(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        part_number: u32,
        src: &ObjectKey,
        range: Option<std::ops::Range<u64>>,
    ) -> Result<Etag, StoreError> {
        self.enter("multipart_copy")?;
        if part_number == 0 || part_number > self.caps.max_parts {
            return Err(StoreError::Invalid(format!(
                "part number {} out of range",
                part_number
            )));
        }
        let data = {
            let objects = self.objects.lock().unwrap();
            let object = objects
                .get(src.as_str())
                .ok_or_else(|| StoreError::NotFound(src.to_string()))?;
            match range {
                None => object.data.clone(),
                Some(range) => {
                    let end = range.end.min(object.data.len() as u64);
                    if range.start > end {
                        return Err(StoreError::Invalid("empty copy range".to_string()));
                    }
                    object.data[range.start as usize..end as usize].to_vec()
                }
            }
        };
        let mut uploads = self.uploads.lock().unwrap();
        let session = uploads
            .get_mut(upload.as_str())
            .filter(|s| s.key == key.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("upload {upload}")))?;
        let etag = Self::content_etag(&data);
        session.parts.insert(part_number, (etag.clone(), data));
        Ok(etag)
    }

    async fn multipart_commit(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
        parts: &[MultipartPart],
    ) -> Result<PutBlobOutput, StoreError> {
        self.enter("multipart_commit")?;
        let session = {
            let mut uploads = self.uploads.lock().unwrap();
            uploads
                .remove(upload.as_str())
                .filter(|s| s.key == key.as_str())
                .ok_or_else(|| StoreError::NotFound(format!("upload {upload}")))?
        };

        let mut data = Vec::new();
        let mut etags = Vec::new();
        let mut last_number = 0;
        for (index, part) in parts.iter().enumerate() {
            if part.number <= last_number {
                return Err(StoreError::Invalid(format!(
                    "part numbers not monotonic at {}",
                    part.number
                )));
            }
            last_number = part.number;

            let (stored_etag, bytes) = session.parts.get(&part.number).ok_or_else(|| {
                StoreError::Invalid(format!("part {} was never uploaded", part.number))
            })?;
            if *stored_etag != part.etag {
                return Err(StoreError::Invalid(format!(
                    "etag mismatch for part {}",
                    part.number
                )));
            }
            let is_last = index == parts.len() - 1;
            if !is_last && (bytes.len() as u64) < self.caps.min_part_size {
                return Err(StoreError::TooLarge(format!(
                    "part {} below minimum size",
                    part.number
                )));
            }
            data.extend_from_slice(bytes);
            etags.push(stored_etag);
        }

        let etag = Self::multipart_etag(&etags);
        let mtime = Utc::now();
        self.objects.lock().unwrap().insert(
            session.key,
            StoredObject {
                data,
                etag: etag.clone(),
                mtime,
                metadata: session.metadata,
                storage_class: None,
            },
        );
        Ok(PutBlobOutput { etag, mtime })
    }

    async fn multipart_abort(
        &self,
        key: &ObjectKey,
        upload: &UploadId,
    ) -> Result<(), StoreError> {
        self.enter("multipart_abort")?;
        let mut uploads = self.uploads.lock().unwrap();
        uploads
            .remove(upload.as_str())
            .filter(|s| s.key == key.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("upload {upload}")))?;
        Ok(())
    }

    async fn list_multipart_uploads(
        &self,
        prefix: &str,
    ) -> Result<Vec<UploadListing>, StoreError> {
        self.enter("list_multipart_uploads")?;
        let uploads = self.uploads.lock().unwrap();
        let mut listings = Vec::new();
        for (id, session) in uploads.iter() {
            if session.key.starts_with(prefix) {
                listings.push(UploadListing {
                    key: ObjectKey::new(session.key.clone())
                        .map_err(|e| StoreError::Invalid(e.to_string()))?,
                    upload_id: UploadId::new(id.clone()),
                    metadata: session.metadata.clone(),
                });
            }
        }
        listings.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listings)
    }
}
