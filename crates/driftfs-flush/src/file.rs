//! Per-file shared state: buffer list, upload state, sticky error and the
//! missing-range fetcher.
//!
//! A `FileSlot` is owned by a file inode and shared with the flusher and
//! prefetcher. One mutex guards the buffer list together with the upload
//! and error state; a separate async gate serialises flusher activity so a
//! file never has two active flushers.
//!
//! Every backend call happens with the mutex released. The read path plans
//! under the lock, marks missing ranges in flight, fetches outside the
//! lock, installs the data and wakes waiters; concurrent readers of an
//! overlapping range share a single GET.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use driftfs_cache::{
    BufferList, BufferPool, Evictable, FlushTicket, ReadSegment, SpillStore, Usage,
};
use driftfs_core::domain::{Etag, FsError, InodeId, ObjectKey, UploadId};
use driftfs_core::ports::{GetBlobRequest, Metadata, ObjectBackend, PutBlobOutput, StoreError};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::multipart::MultipartState;

/// What a completed flush reports back for the inode's metadata.
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    pub etag: Option<Etag>,
    pub mtime: Option<DateTime<Utc>>,
}

/// The backend-facing identity of a file.
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub key: ObjectKey,
    /// Etag observed at the last head/get/put, used for `If-Match` reads.
    pub etag: Option<Etag>,
    /// Metadata to attach on the next upload.
    pub metadata: Metadata,
    /// Whether an object for this file exists on the backend at all.
    pub exists: bool,
    /// Metadata changed; must be pushed even with no dirty bytes.
    pub meta_dirty: bool,
    /// Content must be rewritten even with no dirty bytes (truncate).
    pub needs_rewrite: bool,
}

/// One in-flight fetch, visible to concurrent readers.
struct InflightFetch {
    id: u64,
    start: u64,
    end: u64,
    rx: watch::Receiver<bool>,
}

/// State behind the per-file mutex.
struct FileInner {
    list: BufferList,
    upload: Option<MultipartState>,
    sticky: Option<FsError>,
    fetching: Vec<InflightFetch>,
    fetch_seq: u64,
}

/// A flush snapshot: either the assembled bytes with their ticket, or the
/// ranges that must be fetched before the snapshot can be taken.
pub enum Snapshot {
    Ready { data: Vec<u8>, ticket: FlushTicket },
    NeedFetch { ranges: Vec<(u64, u64)> },
}

/// Shared per-file state.
pub struct FileSlot {
    ino: InodeId,
    inner: Mutex<FileInner>,
    /// At most one active flusher per file.
    flush_gate: tokio::sync::Mutex<()>,
    remote: Mutex<RemoteState>,
    pool: Arc<BufferPool>,
    spill: Option<Arc<SpillStore>>,
}

impl FileSlot {
    pub fn new(
        ino: InodeId,
        key: ObjectKey,
        pool: Arc<BufferPool>,
        spill: Option<Arc<SpillStore>>,
    ) -> Arc<Self> {
        let slot = Arc::new(Self {
            ino,
            inner: Mutex::new(FileInner {
                list: BufferList::new(),
                upload: None,
                sticky: None,
                fetching: Vec::new(),
                fetch_seq: 0,
            }),
            flush_gate: tokio::sync::Mutex::new(()),
            remote: Mutex::new(RemoteState {
                key,
                etag: None,
                metadata: Metadata::new(),
                exists: false,
                meta_dirty: false,
                needs_rewrite: false,
            }),
            pool: Arc::clone(&pool),
            spill,
        });
        pool.register(
            ino.get(),
            Arc::downgrade(&slot) as std::sync::Weak<dyn Evictable>,
        );
        slot
    }

    pub fn ino(&self) -> InodeId {
        self.ino
    }

    /// Runs `f` under the file lock and settles the pool accounting delta
    /// afterwards (with the lock released, since settling may evict).
    fn with_inner<R>(&self, f: impl FnOnce(&mut FileInner) -> R) -> R {
        let (result, before, after) = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.list.usage();
            let result = f(&mut inner);
            let after = inner.list.usage();
            (result, before, after)
        };
        if before != after {
            self.pool.update(before, after);
        }
        result
    }

    // ========================================================================
    // Remote identity
    // ========================================================================

    pub fn remote(&self) -> RemoteState {
        self.remote.lock().unwrap().clone()
    }

    /// Adopts a remote object observed by lookup/open.
    pub fn adopt_remote(&self, etag: Etag, metadata: Metadata, size: u64) {
        {
            let mut remote = self.remote.lock().unwrap();
            remote.etag = Some(etag);
            remote.metadata = metadata;
            remote.exists = true;
        }
        self.with_inner(|inner| inner.list.set_remote_size(size));
    }

    /// Points the file at a new key after a rename.
    pub fn set_key(&self, key: ObjectKey) {
        self.remote.lock().unwrap().key = key;
    }

    /// Replaces the metadata to be attached on the next upload.
    pub fn set_metadata(&self, metadata: Metadata) {
        let mut remote = self.remote.lock().unwrap();
        remote.metadata = metadata;
        remote.meta_dirty = true;
    }

    // ========================================================================
    // Sticky errors
    // ========================================================================

    pub fn sticky(&self) -> Option<FsError> {
        self.inner.lock().unwrap().sticky.clone()
    }

    pub fn set_sticky(&self, err: FsError) {
        warn!(ino = %self.ino, %err, "flush error now sticks to inode");
        self.inner.lock().unwrap().sticky = Some(err);
    }

    /// Clears the sticky error; called when the last handle closes.
    pub fn clear_sticky(&self) {
        self.inner.lock().unwrap().sticky = None;
    }

    // ========================================================================
    // Data plane
    // ========================================================================

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().list.size()
    }

    pub fn dirty_total(&self) -> u64 {
        self.inner.lock().unwrap().list.usage().dirty_total
    }

    /// True when something must reach the backend before the file is in
    /// sync: dirty bytes, a pending rewrite, changed metadata, or no
    /// remote object yet.
    pub fn needs_flush(&self) -> bool {
        if !self.inner.lock().unwrap().list.is_clean() {
            return true;
        }
        let remote = self.remote.lock().unwrap();
        !remote.exists || remote.meta_dirty || remote.needs_rewrite
    }

    /// Applies a write. Blocks while the pool is over its dirty watermark.
    pub async fn write(
        &self,
        offset: u64,
        data: &[u8],
        max_buffer: u64,
    ) -> Result<(), FsError> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        self.pool.reserve_dirty(data.len() as u64).await;
        self.pool.touch(self.ino.get());
        self.with_inner(|inner| inner.list.write(offset, data, max_buffer));
        Ok(())
    }

    /// Truncates or extends; a shrink or in-place grow forces a rewrite of
    /// the remote object on the next flush.
    pub fn truncate(&self, new_size: u64) -> Result<(), FsError> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        self.with_inner(|inner| inner.list.truncate(new_size));
        let mut remote = self.remote.lock().unwrap();
        if remote.exists {
            remote.needs_rewrite = true;
        }
        Ok(())
    }

    /// Reads `[offset, offset + len)` clipped to the file size, fetching
    /// missing ranges from the backend.
    pub async fn read(
        &self,
        backend: &dyn ObjectBackend,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, FsError> {
        if let Some(err) = self.sticky() {
            return Err(err);
        }
        self.pool.touch(self.ino.get());
        let end = offset.saturating_add(len).min(self.size());
        if offset >= end {
            return Ok(Vec::new());
        }

        // Fetched clean data can be evicted again between the fetch and the
        // assembly under memory pressure; retry a few times before giving
        // in to the thrash.
        for _ in 0..8 {
            self.fetch_missing(backend, offset, end).await?;
            let assembled = self.with_inner(|inner| {
                Self::assemble(&inner.list.read_plan(offset, end - offset), self.spill.as_deref())
            })?;
            if let Some(bytes) = assembled {
                return Ok(bytes);
            }
        }
        Err(FsError::Busy(format!(
            "cache thrash while reading inode {}",
            self.ino
        )))
    }

    /// Renders a plan into bytes; `None` if a segment is missing.
    fn assemble(
        plan: &[ReadSegment],
        spill: Option<&SpillStore>,
    ) -> Result<Option<Vec<u8>>, FsError> {
        let total: u64 = plan.iter().map(ReadSegment::len).sum();
        let mut out = Vec::with_capacity(total as usize);
        for segment in plan {
            match segment {
                ReadSegment::Memory { bytes, .. } => out.extend_from_slice(bytes),
                ReadSegment::Zero { len, .. } => out.resize(out.len() + *len as usize, 0),
                ReadSegment::Spilled {
                    path, skip, len, ..
                } => {
                    let store = spill.ok_or_else(|| {
                        FsError::Io("spilled buffer without a spill store".to_string())
                    })?;
                    out.extend_from_slice(&store.read(path, *skip, *len)?);
                }
                ReadSegment::Missing { .. } => return Ok(None),
            }
        }
        Ok(Some(out))
    }

    /// Ensures `[start, end)` is locally present, sharing in-flight fetches
    /// with concurrent callers.
    pub async fn fetch_missing(
        &self,
        backend: &dyn ObjectBackend,
        start: u64,
        end: u64,
    ) -> Result<(), FsError> {
        enum Step {
            Done,
            Wait(watch::Receiver<bool>),
            Fetch {
                id: u64,
                ranges: Vec<(u64, u64)>,
                tx: watch::Sender<bool>,
            },
        }

        loop {
            let step = self.with_inner(|inner| {
                let missing: Vec<(u64, u64)> = inner
                    .list
                    .read_plan(start, end - start)
                    .into_iter()
                    .filter_map(|segment| match segment {
                        ReadSegment::Missing { offset, len } => Some((offset, len)),
                        _ => None,
                    })
                    .collect();
                if missing.is_empty() {
                    return Step::Done;
                }
                let overlapping = inner.fetching.iter().find(|f| {
                    missing
                        .iter()
                        .any(|&(o, l)| o < f.end && o + l > f.start)
                });
                if let Some(fetch) = overlapping {
                    return Step::Wait(fetch.rx.clone());
                }
                let (tx, rx) = watch::channel(false);
                inner.fetch_seq += 1;
                let id = inner.fetch_seq;
                for &(offset, len) in &missing {
                    inner.fetching.push(InflightFetch {
                        id,
                        start: offset,
                        end: offset + len,
                        rx: rx.clone(),
                    });
                }
                Step::Fetch {
                    id,
                    ranges: missing,
                    tx,
                }
            });

            match step {
                Step::Done => return Ok(()),
                Step::Wait(mut rx) => {
                    // The fetch owner always sends on completion; a closed
                    // channel just means it finished and dropped the sender.
                    let _ = rx.changed().await;
                }
                Step::Fetch { id, ranges, tx } => {
                    let result = self.run_fetch(backend, &ranges).await;
                    self.with_inner(|inner| inner.fetching.retain(|f| f.id != id));
                    let _ = tx.send(true);
                    result?;
                }
            }
        }
    }

    /// Issues the GETs for a fetch, revalidating the cached etag. A 412
    /// means the remote object changed: cached clean data and the etag are
    /// discarded and the read retried unconditionally.
    async fn run_fetch(
        &self,
        backend: &dyn ObjectBackend,
        ranges: &[(u64, u64)],
    ) -> Result<(), FsError> {
        for &(offset, len) in ranges {
            let (key, if_match) = {
                let remote = self.remote.lock().unwrap();
                (remote.key.clone(), remote.etag.clone())
            };
            let request = GetBlobRequest {
                key: key.clone(),
                range: Some(offset..offset + len),
                if_match,
            };
            let output = match backend.get_blob(&request).await {
                Ok(output) => output,
                Err(StoreError::PreconditionFailed(_)) => {
                    debug!(ino = %self.ino, "etag mismatch, revalidating remote object");
                    self.with_inner(|inner| inner.list.drop_clean());
                    self.remote.lock().unwrap().etag = None;
                    let retry = GetBlobRequest {
                        key,
                        range: Some(offset..offset + len),
                        if_match: None,
                    };
                    let output = backend.get_blob(&retry).await.map_err(FsError::from)?;
                    self.remote.lock().unwrap().etag = Some(output.etag.clone());
                    output
                }
                Err(err) => return Err(err.into()),
            };
            trace!(ino = %self.ino, offset, len, "installed fetched range");
            self.with_inner(|inner| inner.list.install_clean(offset, &output.data));
        }
        Ok(())
    }

    // ========================================================================
    // Flush support
    // ========================================================================

    /// Serialises flusher activity on this file.
    pub async fn flush_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.flush_gate.lock().await
    }

    pub fn try_flush_gate(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        self.flush_gate.try_lock().ok()
    }

    /// Snapshots the whole file for a single PUT.
    pub fn snapshot_whole(&self) -> Result<Snapshot, FsError> {
        self.with_inner(|inner| {
            let size = inner.list.size();
            Self::snapshot_locked(inner, 0, size, None, self.spill.as_deref())
        })
    }

    /// Snapshots one part range for a multipart upload.
    pub fn snapshot_range(
        &self,
        start: u64,
        end: u64,
        part_number: u32,
    ) -> Result<Snapshot, FsError> {
        self.with_inner(|inner| {
            Self::snapshot_locked(inner, start, end, Some(part_number), self.spill.as_deref())
        })
    }

    fn snapshot_locked(
        inner: &mut FileInner,
        start: u64,
        end: u64,
        part_number: Option<u32>,
        spill: Option<&SpillStore>,
    ) -> Result<Snapshot, FsError> {
        let plan = inner.list.read_plan(start, end - start);
        let missing: Vec<(u64, u64)> = plan
            .iter()
            .filter_map(|segment| match segment {
                ReadSegment::Missing { offset, len } => Some((*offset, *len)),
                _ => None,
            })
            .collect();
        if !missing.is_empty() {
            return Ok(Snapshot::NeedFetch { ranges: missing });
        }
        let data = Self::assemble(&plan, spill)?.expect("plan has no missing segments");
        let ticket = inner.list.mark_flushing(start..end, part_number);
        Ok(Snapshot::Ready { data, ticket })
    }

    /// Applies a successful whole-object flush.
    pub fn complete_put(&self, ticket: &FlushTicket, output: &PutBlobOutput) {
        let spilled = self.with_inner(|inner| inner.list.complete_flush(ticket));
        self.remove_spill_files(&spilled);
        let mut remote = self.remote.lock().unwrap();
        remote.etag = Some(output.etag.clone());
        remote.exists = true;
        remote.meta_dirty = false;
        remote.needs_rewrite = false;
    }

    /// Applies a metadata-only rewrite (copy onto itself).
    pub fn complete_meta_update(&self, etag: Etag) {
        let mut remote = self.remote.lock().unwrap();
        remote.etag = Some(etag);
        remote.meta_dirty = false;
    }

    /// Reverts the buffers of a failed flush attempt.
    pub fn fail_ticket(&self, ticket: &FlushTicket) {
        self.with_inner(|inner| inner.list.fail_flush(ticket));
    }

    fn remove_spill_files(&self, paths: &[std::path::PathBuf]) {
        if let Some(spill) = &self.spill {
            for path in paths {
                spill.remove(path);
            }
        }
    }

    // ========================================================================
    // Multipart upload state
    // ========================================================================

    pub fn upload_active(&self) -> bool {
        self.inner.lock().unwrap().upload.is_some()
    }

    /// Runs `f` with mutable access to the upload slot.
    pub fn with_upload<R>(&self, f: impl FnOnce(&mut Option<MultipartState>) -> R) -> R {
        f(&mut self.inner.lock().unwrap().upload)
    }

    /// Offset of the first dirty byte, for behind-the-cursor detection.
    pub fn min_unflushed_offset(&self) -> Option<u64> {
        self.inner.lock().unwrap().list.min_unflushed_offset()
    }

    /// True when `[start, end)` holds no locally written data and is
    /// therefore byte-identical to the remote object.
    pub fn range_is_remote_clean(&self, start: u64, end: u64) -> bool {
        self.inner.lock().unwrap().list.is_remote_clean(start..end)
    }

    /// Finishes a committed upload: every part buffer becomes clean.
    pub fn complete_upload(&self, output: &PutBlobOutput) {
        let spilled = self.with_inner(|inner| {
            let upload = inner.upload.take().expect("upload active at commit");
            let mut spilled = Vec::new();
            for ticket in &upload.tickets {
                spilled.extend(inner.list.complete_flush(ticket));
            }
            spilled
        });
        self.remove_spill_files(&spilled);
        let mut remote = self.remote.lock().unwrap();
        remote.etag = Some(output.etag.clone());
        remote.exists = true;
        remote.meta_dirty = false;
        remote.needs_rewrite = false;
    }

    /// Takes the upload down, reverting its buffers to dirty. Returns what
    /// the caller needs for the backend abort call.
    pub fn take_failed_upload(&self) -> Option<(ObjectKey, UploadId)> {
        self.with_inner(|inner| {
            inner.upload.take().map(|upload| {
                for ticket in &upload.tickets {
                    inner.list.fail_flush(ticket);
                }
                (upload.key, upload.upload_id)
            })
        })
    }

    /// Spills memory-resident dirty buffers under pool pressure.
    pub fn spill_pressure(&self, target: u64) -> std::io::Result<u64> {
        let Some(spill) = self.spill.clone() else {
            return Ok(0);
        };
        let ino = self.ino.get();
        self.with_inner(|inner| inner.list.spill_dirty(ino, &spill, target))
    }
}

impl Evictable for FileSlot {
    fn evict_clean(&self, target: u64) -> u64 {
        // Called from pool eviction with the pool adjusting its own
        // accounting; try_lock avoids deadlocking against a holder that
        // triggered the eviction.
        match self.inner.try_lock() {
            Ok(mut inner) => inner.list.evict_clean(target),
            Err(_) => 0,
        }
    }
}

impl Drop for FileSlot {
    fn drop(&mut self) {
        let usage = self.inner.get_mut().unwrap().list.usage();
        if usage != Usage::default() {
            self.pool.update(usage, Usage::default());
        }
        self.pool.deregister(self.ino.get());
    }
}
