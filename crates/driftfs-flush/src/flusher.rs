//! The dirty-buffer flusher.
//!
//! A pool of worker tasks consumes per-file flush requests from a channel.
//! `Sync` drains a file to clean (the close-to-open barrier: release, flush
//! and fsync all go through it); `Drain` makes opportunistic progress so
//! memory pressure resolves without blocking anyone longer than needed.
//!
//! Small files go up as one PUT of the assembled object. Files at or above
//! the multipart threshold run the upload machine: contiguous ranges are
//! assigned monotonically increasing part numbers and uploaded with bounded
//! concurrency; a write landing behind the assigned cursor aborts and
//! restarts the upload; commit assembles the final object. Buffers of
//! assigned parts stay pinned in `Flushing` until commit so a restart can
//! re-upload them from memory.

use std::ops::Range;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use driftfs_cache::{BufferPool, FlushTicket};
use driftfs_core::config::FlushConfig;
use driftfs_core::domain::FsError;
use driftfs_core::metrics::MetricsRegistry;
use driftfs_core::ports::{ObjectBackend, PutBlobRequest, StoreError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::file::{FileSlot, FlushOutcome, Snapshot};
use crate::multipart::MultipartState;

/// Metadata key marking multipart uploads started by this filesystem, so
/// the startup reaper only aborts its own leftovers.
pub const UPLOADER_META_KEY: &str = "dfs-uploader";

/// Requests consumed by the flusher workers.
enum FlushRequest {
    /// Drain the file to clean and report the outcome.
    Sync {
        file: Arc<FileSlot>,
        reply: oneshot::Sender<Result<FlushOutcome, FsError>>,
    },
    /// Make progress without a caller waiting.
    Drain { file: Arc<FileSlot> },
}

// ============================================================================
// FlusherHandle
// ============================================================================

/// Cloneable handle for submitting flush work.
#[derive(Clone)]
pub struct FlusherHandle {
    tx: mpsc::Sender<FlushRequest>,
    /// Files known to carry dirty data, kicked under memory pressure.
    dirty: Arc<DashMap<u64, Weak<FileSlot>>>,
}

impl FlusherHandle {
    /// Flushes everything the file owes the backend and waits for it.
    pub async fn sync(&self, file: &Arc<FileSlot>) -> Result<FlushOutcome, FsError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(FlushRequest::Sync {
                file: Arc::clone(file),
                reply: tx,
            })
            .await
            .map_err(|_| FsError::Io("flusher stopped".to_string()))?;
        rx.await
            .map_err(|_| FsError::Io("flusher reply lost".to_string()))?
    }

    /// Queues an opportunistic drain; silently dropped when the queue is
    /// full (another drain is already pending).
    pub fn drain(&self, file: &Arc<FileSlot>) {
        let _ = self.tx.try_send(FlushRequest::Drain {
            file: Arc::clone(file),
        });
    }

    /// Remembers a file as dirty so a later [`kick`](Self::kick) reaches it.
    pub fn note_dirty(&self, file: &Arc<FileSlot>) {
        self.dirty
            .insert(file.ino().get(), Arc::downgrade(file));
    }

    /// Queues a drain for every known-dirty file. Wired into the buffer
    /// pool as the pressure hook.
    pub fn kick(&self) {
        self.dirty.retain(|_, weak| match weak.upgrade() {
            Some(file) if file.needs_flush() => {
                let _ = self.tx.try_send(FlushRequest::Drain { file });
                true
            }
            _ => false,
        });
    }
}

// ============================================================================
// Flusher
// ============================================================================

struct FlushCtx {
    backend: Arc<dyn ObjectBackend>,
    config: FlushConfig,
    pool: Arc<BufferPool>,
    metrics: Option<Arc<MetricsRegistry>>,
}

/// The flusher worker pool. Create it, wire the handle everywhere, then
/// spawn [`run`](Flusher::run) on the runtime.
pub struct Flusher {
    rx: mpsc::Receiver<FlushRequest>,
    ctx: Arc<FlushCtx>,
}

impl Flusher {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        config: FlushConfig,
        pool: Arc<BufferPool>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> (Self, FlusherHandle) {
        let (tx, rx) = mpsc::channel(256);
        let flusher = Self {
            rx,
            ctx: Arc::new(FlushCtx {
                backend,
                config,
                pool,
                metrics,
            }),
        };
        let handle = FlusherHandle {
            tx,
            dirty: Arc::new(DashMap::new()),
        };
        (flusher, handle)
    }

    /// Runs the worker pool until every handle is dropped.
    pub async fn run(self) {
        info!(workers = self.ctx.config.workers, "flusher started");
        let rx = Arc::new(tokio::sync::Mutex::new(self.rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.ctx.config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let ctx = Arc::clone(&self.ctx);
            workers.spawn(async move {
                loop {
                    let request = { rx.lock().await.recv().await };
                    match request {
                        Some(request) => process(&ctx, request).await,
                        None => break,
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}
        info!("flusher stopped (all senders dropped)");
    }
}

async fn process(ctx: &FlushCtx, request: FlushRequest) {
    match request {
        FlushRequest::Sync { file, reply } => {
            let result = sync_file(ctx, &file).await;
            let _ = reply.send(result);
        }
        FlushRequest::Drain { file } => {
            if let Err(err) = drain_file(ctx, &file).await {
                debug!(ino = %file.ino(), %err, "background drain failed");
            }
        }
    }
}

/// Converts a backend failure into the error that sticks to the inode.
/// Exhausted transient retries surface as I/O errors, per the taxonomy.
fn flush_error(err: StoreError) -> FsError {
    if err.is_transient() {
        FsError::Io(format!("retries exhausted: {err}"))
    } else {
        err.into()
    }
}

fn threshold_bytes(config: &FlushConfig) -> u64 {
    config.multipart_threshold_mb * 1024 * 1024
}

fn part_size_bytes(ctx: &FlushCtx) -> u64 {
    let caps = ctx.backend.capabilities();
    (ctx.config.part_size_mb * 1024 * 1024).clamp(caps.min_part_size, caps.max_part_size)
}

// ============================================================================
// Sync path
// ============================================================================

async fn sync_file(ctx: &FlushCtx, file: &Arc<FileSlot>) -> Result<FlushOutcome, FsError> {
    let _gate = file.flush_gate().await;
    if let Some(err) = file.sticky() {
        return Err(err);
    }
    if !file.needs_flush() {
        return Ok(FlushOutcome::default());
    }

    let size = file.size();
    if file.upload_active() || (size > 0 && size >= threshold_bytes(&ctx.config)) {
        let outcome = multipart_flush(ctx, file, true).await?;
        return Ok(outcome.unwrap_or_default());
    }

    // Metadata-only change on an otherwise clean object: rewrite in place.
    let remote = file.remote();
    if remote.exists && remote.meta_dirty && !remote.needs_rewrite && file.dirty_total() == 0 {
        let etag = ctx
            .backend
            .copy_blob(&remote.key, &remote.key, Some(&remote.metadata))
            .await
            .map_err(|err| {
                let fs_err = flush_error(err);
                file.set_sticky(fs_err.clone());
                fs_err
            })?;
        file.complete_meta_update(etag.clone());
        return Ok(FlushOutcome {
            etag: Some(etag),
            mtime: None,
        });
    }

    small_flush(ctx, file).await
}

async fn small_flush(ctx: &FlushCtx, file: &Arc<FileSlot>) -> Result<FlushOutcome, FsError> {
    let started = Instant::now();
    for _ in 0..32 {
        match file.snapshot_whole()? {
            Snapshot::NeedFetch { ranges } => {
                // Rewriting the object needs the ranges we never cached.
                for (offset, len) in ranges {
                    file.fetch_missing(ctx.backend.as_ref(), offset, offset + len)
                        .await?;
                }
            }
            Snapshot::Ready { data, ticket } => {
                let remote = file.remote();
                let bytes = data.len() as u64;
                let request = PutBlobRequest {
                    key: remote.key.clone(),
                    data,
                    metadata: remote.metadata.clone(),
                    content_type: None,
                };
                match ctx.backend.put_blob(request).await {
                    Ok(output) => {
                        file.complete_put(&ticket, &output);
                        debug!(ino = %file.ino(), key = %remote.key, bytes, "small flush done");
                        if let Some(metrics) = &ctx.metrics {
                            metrics
                                .flush_duration_seconds
                                .with_label_values(&["small"])
                                .observe(started.elapsed().as_secs_f64());
                            metrics
                                .transfer_bytes_total
                                .with_label_values(&["upload"])
                                .inc_by(bytes);
                        }
                        return Ok(FlushOutcome {
                            etag: Some(output.etag),
                            mtime: Some(output.mtime),
                        });
                    }
                    Err(err) => {
                        file.fail_ticket(&ticket);
                        let fs_err = flush_error(err);
                        file.set_sticky(fs_err.clone());
                        return Err(fs_err);
                    }
                }
            }
        }
    }
    Err(FsError::Busy(format!(
        "cache thrash while flushing inode {}",
        file.ino()
    )))
}

// ============================================================================
// Multipart path
// ============================================================================

/// One part's worth of work for the upload batch.
enum PartJob {
    /// Send the assembled bytes.
    Upload { number: u32, data: Vec<u8> },
    /// Build the part server-side from the previous object version.
    Copy { number: u32, range: Range<u64> },
}

/// Drives the multipart machine. With `finalize` the upload is committed
/// and the outcome returned; without it, full parts are shipped and the
/// upload stays open for the next round.
async fn multipart_flush(
    ctx: &FlushCtx,
    file: &Arc<FileSlot>,
    finalize: bool,
) -> Result<Option<FlushOutcome>, FsError> {
    let started = Instant::now();
    let part_size = part_size_bytes(ctx);

    'restart: loop {
        if !file.upload_active() {
            if file.dirty_total() == 0 && !finalize {
                return Ok(None);
            }
            let remote = file.remote();
            let mut metadata = remote.metadata.clone();
            metadata.insert(UPLOADER_META_KEY.to_string(), "driftfs".to_string());
            let upload_id = ctx
                .backend
                .multipart_begin(&remote.key, &metadata)
                .await
                .map_err(|err| {
                    let fs_err = flush_error(err);
                    file.set_sticky(fs_err.clone());
                    fs_err
                })?;
            debug!(ino = %file.ino(), key = %remote.key, %upload_id, "multipart upload begun");
            file.with_upload(|upload| {
                *upload = Some(MultipartState::new(upload_id, remote.key, metadata))
            });
        }

        // Ranges without local modifications can be covered by server-side
        // copies of the previous object version instead of re-sent bytes.
        let part_copy_ok =
            ctx.backend.capabilities().supports_part_copy && file.remote().exists;

        loop {
            let assigned = file.with_upload(|upload| {
                upload.as_ref().expect("upload active").assigned_bytes
            });

            // A write landed behind the cursor: the assigned prefix no
            // longer matches the file. Abort and start over; the restarted
            // upload re-covers still-unmodified ranges with part copies
            // where the backend supports them.
            if let Some(min_dirty) = file.min_unflushed_offset() {
                if min_dirty < assigned {
                    warn!(
                        ino = %file.ino(),
                        min_dirty,
                        assigned,
                        "write behind upload cursor, restarting multipart upload"
                    );
                    if let Some((key, upload_id)) = file.take_failed_upload() {
                        let _ = ctx.backend.multipart_abort(&key, &upload_id).await;
                    }
                    continue 'restart;
                }
            }

            let size = file.size();
            if assigned >= size {
                break;
            }
            if !finalize && size - assigned < part_size {
                // Drain mode leaves the short tail for the final flush.
                break;
            }

            // Assign a bounded batch of parts.
            let mut jobs = Vec::new();
            let mut cursor = assigned;
            while jobs.len() < ctx.config.part_concurrency.max(1) && cursor < size {
                let end = (cursor + part_size).min(size);
                if !finalize && end - cursor < part_size {
                    break;
                }
                let number = file.with_upload(|upload| {
                    upload.as_ref().expect("upload active").next_part
                });

                // An unmodified range stays server-side: the part is
                // copied out of the previous object version. No buffers
                // are involved, so its ticket is empty.
                if part_copy_ok && file.range_is_remote_clean(cursor, end) {
                    file.with_upload(|upload| {
                        upload.as_mut().expect("upload active").assign_part(
                            end - cursor,
                            FlushTicket {
                                generations: Vec::new(),
                                bytes: 0,
                            },
                        )
                    });
                    jobs.push(PartJob::Copy {
                        number,
                        range: cursor..end,
                    });
                    cursor = end;
                    continue;
                }

                match file.snapshot_range(cursor, end, number)? {
                    Snapshot::NeedFetch { ranges } => {
                        for (offset, len) in ranges {
                            file.fetch_missing(ctx.backend.as_ref(), offset, offset + len)
                                .await?;
                        }
                        continue;
                    }
                    Snapshot::Ready { data, ticket } => {
                        file.with_upload(|upload| {
                            upload
                                .as_mut()
                                .expect("upload active")
                                .assign_part(end - cursor, ticket)
                        });
                        jobs.push(PartJob::Upload { number, data });
                        cursor = end;
                    }
                }
            }
            if jobs.is_empty() {
                break;
            }

            // Ship the batch in parallel.
            let (key, upload_id) = file.with_upload(|upload| {
                let upload = upload.as_ref().expect("upload active");
                (upload.key.clone(), upload.upload_id.clone())
            });
            let mut uploads = JoinSet::new();
            for job in jobs {
                let backend = Arc::clone(&ctx.backend);
                let file = Arc::clone(file);
                let key = key.clone();
                let upload_id = upload_id.clone();
                let metrics = ctx.metrics.clone();
                uploads.spawn(async move {
                    match job {
                        PartJob::Upload { number, data } => {
                            let bytes = data.len() as u64;
                            match backend.multipart_add(&key, &upload_id, number, data).await {
                                Ok(etag) => {
                                    file.with_upload(|upload| {
                                        if let Some(upload) = upload {
                                            upload.record_ack(number, etag);
                                        }
                                    });
                                    if let Some(metrics) = metrics {
                                        metrics
                                            .transfer_bytes_total
                                            .with_label_values(&["upload"])
                                            .inc_by(bytes);
                                    }
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            }
                        }
                        PartJob::Copy { number, range } => {
                            match backend
                                .multipart_copy(&key, &upload_id, number, &key, Some(range))
                                .await
                            {
                                Ok(etag) => {
                                    file.with_upload(|upload| {
                                        if let Some(upload) = upload {
                                            upload.record_ack(number, etag);
                                        }
                                    });
                                    Ok(())
                                }
                                Err(err) => Err(err),
                            }
                        }
                    }
                });
            }
            let mut failure: Option<StoreError> = None;
            while let Some(joined) = uploads.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failure = Some(err),
                    Err(join_err) => failure = Some(StoreError::Io(join_err.to_string())),
                }
            }
            if let Some(err) = failure {
                if let Some((key, upload_id)) = file.take_failed_upload() {
                    let _ = ctx.backend.multipart_abort(&key, &upload_id).await;
                }
                let fs_err = flush_error(err);
                file.set_sticky(fs_err.clone());
                return Err(fs_err);
            }
        }

        if !finalize {
            return Ok(None);
        }

        let (key, upload_id, parts) = file.with_upload(|upload| {
            let upload = upload.as_ref().expect("upload active");
            (
                upload.key.clone(),
                upload.upload_id.clone(),
                upload.commit_parts(),
            )
        });
        match ctx.backend.multipart_commit(&key, &upload_id, &parts).await {
            Ok(output) => {
                file.complete_upload(&output);
                debug!(
                    ino = %file.ino(),
                    key = %key,
                    parts = parts.len(),
                    "multipart upload committed"
                );
                if let Some(metrics) = &ctx.metrics {
                    metrics
                        .flush_duration_seconds
                        .with_label_values(&["multipart"])
                        .observe(started.elapsed().as_secs_f64());
                }
                return Ok(Some(FlushOutcome {
                    etag: Some(output.etag),
                    mtime: Some(output.mtime),
                }));
            }
            Err(err) => {
                if let Some((key, upload_id)) = file.take_failed_upload() {
                    let _ = ctx.backend.multipart_abort(&key, &upload_id).await;
                }
                let fs_err = flush_error(err);
                file.set_sticky(fs_err.clone());
                return Err(fs_err);
            }
        }
    }
}

// ============================================================================
// Drain path
// ============================================================================

async fn drain_file(ctx: &FlushCtx, file: &Arc<FileSlot>) -> Result<(), FsError> {
    let Some(_gate) = file.try_flush_gate() else {
        // A sync is already working on this file.
        return Ok(());
    };
    if file.sticky().is_some() || !file.needs_flush() {
        return Ok(());
    }

    let size = file.size();
    if file.upload_active() || (size > 0 && size >= threshold_bytes(&ctx.config)) {
        multipart_flush(ctx, file, false).await?;
    } else if file.dirty_total() > 0 {
        small_flush(ctx, file).await?;
    }

    // Whatever tail could not be shipped yet stops hogging memory.
    if ctx.pool.over_high_watermark() {
        if let Ok(spilled) = file.spill_pressure(u64::MAX) {
            if spilled > 0 {
                debug!(ino = %file.ino(), spilled, "spilled dirty tail under pressure");
            }
        }
    }
    Ok(())
}

// ============================================================================
// Startup reaper
// ============================================================================

/// Aborts leftover multipart uploads that carry our uploader marker.
/// Called once at mount; uploads from other writers are left alone.
pub async fn reap_stale_uploads(
    backend: &dyn ObjectBackend,
    prefix: &str,
) -> Result<usize, FsError> {
    let uploads = backend.list_multipart_uploads(prefix).await.map_err(FsError::from)?;
    let mut reaped = 0;
    for upload in uploads {
        if upload.metadata.contains_key(UPLOADER_META_KEY) {
            info!(key = %upload.key, upload_id = %upload.upload_id, "aborting stale upload");
            backend
                .multipart_abort(&upload.key, &upload.upload_id)
                .await
                .map_err(FsError::from)?;
            reaped += 1;
        }
    }
    Ok(reaped)
}

#[cfg(test)]
mod tests {
    use driftfs_core::config::CacheConfig;
    use driftfs_core::domain::{InodeId, ObjectKey};
    use driftfs_core::ports::{Capabilities, Metadata};
    use driftfs_store::MemoryBackend;

    use super::*;

    const MAX: u64 = 1 << 20;

    fn key(raw: &str) -> ObjectKey {
        ObjectKey::new(raw).unwrap()
    }

    /// 16-byte parts: the configured part size clamps up to this minimum.
    fn tiny_caps() -> Capabilities {
        Capabilities {
            min_part_size: 16,
            max_part_size: 16,
            ..Capabilities::default()
        }
    }

    /// Flusher where every file of 1 byte or more takes the multipart path
    /// with 16-byte parts.
    fn multipart_rig(backend: MemoryBackend) -> (Arc<MemoryBackend>, FlusherHandle, Arc<BufferPool>) {
        let backend = Arc::new(backend);
        let pool = BufferPool::new(&CacheConfig::default());
        let config = FlushConfig {
            multipart_threshold_mb: 0,
            part_size_mb: 0,
            workers: 2,
            part_concurrency: 4,
            ..FlushConfig::default()
        };
        let (flusher, handle) = Flusher::new(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            config,
            Arc::clone(&pool),
            None,
        );
        tokio::spawn(flusher.run());
        (backend, handle, pool)
    }

    fn small_rig(backend: MemoryBackend) -> (Arc<MemoryBackend>, FlusherHandle, Arc<BufferPool>) {
        let backend = Arc::new(backend);
        let pool = BufferPool::new(&CacheConfig::default());
        let (flusher, handle) = Flusher::new(
            Arc::clone(&backend) as Arc<dyn ObjectBackend>,
            FlushConfig::default(),
            Arc::clone(&pool),
            None,
        );
        tokio::spawn(flusher.run());
        (backend, handle, pool)
    }

    #[tokio::test]
    async fn test_small_flush_round_trip() {
        let (backend, handle, pool) = small_rig(MemoryBackend::new());
        let file = FileSlot::new(InodeId::new(2), key("a.txt"), pool, None);
        file.write(0, b"hello", MAX).await.unwrap();

        let outcome = handle.sync(&file).await.unwrap();
        assert!(outcome.etag.is_some());
        assert_eq!(backend.object_bytes("a.txt").unwrap(), b"hello");
        assert!(!file.needs_flush());
        assert_eq!(file.remote().etag, outcome.etag);
    }

    #[tokio::test]
    async fn test_empty_new_file_creates_empty_object() {
        let (backend, handle, pool) = small_rig(MemoryBackend::new());
        let file = FileSlot::new(InodeId::new(2), key("empty.txt"), pool, None);

        handle.sync(&file).await.unwrap();
        assert_eq!(backend.object_bytes("empty.txt").unwrap(), b"");
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_when_clean() {
        let (backend, handle, pool) = small_rig(MemoryBackend::new());
        let file = FileSlot::new(InodeId::new(2), key("a.txt"), pool, None);
        file.write(0, b"data", MAX).await.unwrap();
        handle.sync(&file).await.unwrap();

        let puts = backend.op_count("put_blob");
        let outcome = handle.sync(&file).await.unwrap();
        assert!(outcome.etag.is_none());
        assert_eq!(backend.op_count("put_blob"), puts);
    }

    #[tokio::test]
    async fn test_multipart_flush_and_etag_shape() {
        let (backend, handle, pool) = multipart_rig(MemoryBackend::with_capabilities(tiny_caps()));
        let file = FileSlot::new(InodeId::new(2), key("big.bin"), pool, None);
        // 40 bytes with 16-byte parts: 16 + 16 + 8.
        let payload: Vec<u8> = (0..40u8).collect();
        file.write(0, &payload, MAX).await.unwrap();

        let outcome = handle.sync(&file).await.unwrap();
        assert_eq!(backend.object_bytes("big.bin").unwrap(), payload);
        assert!(outcome.etag.unwrap().as_str().ends_with("-3"));
        assert_eq!(backend.open_uploads(), 0);
        assert!(!file.needs_flush());
    }

    #[tokio::test]
    async fn test_drain_ships_full_parts_and_sync_commits() {
        let (backend, handle, pool) = multipart_rig(MemoryBackend::with_capabilities(tiny_caps()));
        let file = FileSlot::new(InodeId::new(2), key("big.bin"), pool, None);
        file.write(0, &[1u8; 36], MAX).await.unwrap();

        handle.drain(&file);
        // Wait for the background drain to ship the two full parts.
        for _ in 0..100 {
            if backend.op_count("multipart_add") >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(file.upload_active());
        assert!(!backend.contains("big.bin"));

        // The tail goes up with the commit.
        handle.sync(&file).await.unwrap();
        assert_eq!(backend.object_bytes("big.bin").unwrap(), vec![1u8; 36]);
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_write_behind_cursor_restarts_upload() {
        let (backend, handle, pool) = multipart_rig(MemoryBackend::with_capabilities(tiny_caps()));
        let file = FileSlot::new(InodeId::new(2), key("big.bin"), pool, None);
        let mut payload = vec![1u8; 36];
        file.write(0, &payload, MAX).await.unwrap();

        handle.drain(&file);
        for _ in 0..100 {
            if file.with_upload(|u| u.as_ref().map(|u| u.assigned_bytes).unwrap_or(0)) >= 32 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Rewrite a byte inside the already-assigned prefix.
        file.write(3, &[9], MAX).await.unwrap();
        payload[3] = 9;

        handle.sync(&file).await.unwrap();
        assert_eq!(backend.object_bytes("big.bin").unwrap(), payload);
        assert_eq!(backend.open_uploads(), 0);
        // The first upload was aborted along the way.
        assert!(backend.op_count("multipart_abort") >= 1);
    }

    #[tokio::test]
    async fn test_tail_write_copies_clean_prefix_parts() {
        let seeded = MemoryBackend::with_capabilities(tiny_caps());
        let payload: Vec<u8> = (0..48u8).collect();
        let out = seeded
            .put_blob(PutBlobRequest {
                key: key("big.bin"),
                data: payload.clone(),
                metadata: Metadata::new(),
                content_type: None,
            })
            .await
            .unwrap();

        let (backend, handle, pool) = multipart_rig(seeded);
        let file = FileSlot::new(InodeId::new(2), key("big.bin"), pool, None);
        file.adopt_remote(out.etag, Metadata::new(), 48);
        // Only the tail changes locally.
        file.write(40, &[0xEE; 8], MAX).await.unwrap();

        handle.sync(&file).await.unwrap();

        let mut expected = payload;
        expected[40..].copy_from_slice(&[0xEE; 8]);
        assert_eq!(backend.object_bytes("big.bin").unwrap(), expected);
        // The two untouched 16-byte parts went up as server-side copies;
        // only the modified part carried bytes.
        assert_eq!(backend.op_count("multipart_copy"), 2);
        assert_eq!(backend.op_count("multipart_add"), 1);
        assert!(!file.needs_flush());
    }

    #[tokio::test]
    async fn test_behind_cursor_restart_reuses_part_copies() {
        let seeded = MemoryBackend::with_capabilities(tiny_caps());
        let payload: Vec<u8> = (0..64u8).collect();
        let out = seeded
            .put_blob(PutBlobRequest {
                key: key("big.bin"),
                data: payload.clone(),
                metadata: Metadata::new(),
                content_type: None,
            })
            .await
            .unwrap();

        let (backend, handle, pool) = multipart_rig(seeded);
        let file = FileSlot::new(InodeId::new(2), key("big.bin"), pool, None);
        file.adopt_remote(out.etag, Metadata::new(), 64);
        file.write(48, &[0xEE; 16], MAX).await.unwrap();

        // Drain assigns all four parts: three copies plus the dirty tail.
        handle.drain(&file);
        for _ in 0..100 {
            let assigned =
                file.with_upload(|u| u.as_ref().map(|u| u.assigned_bytes).unwrap_or(0));
            if assigned >= 64 {
                if let Some(gate) = file.try_flush_gate() {
                    drop(gate);
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(backend.op_count("multipart_copy"), 3);

        // A write behind the cursor restarts the upload; the restarted one
        // still covers the unmodified middle with part copies.
        file.write(0, &[9; 4], MAX).await.unwrap();
        handle.sync(&file).await.unwrap();

        let mut expected = payload;
        expected[..4].copy_from_slice(&[9; 4]);
        expected[48..].copy_from_slice(&[0xEE; 16]);
        assert_eq!(backend.object_bytes("big.bin").unwrap(), expected);
        assert_eq!(backend.op_count("multipart_abort"), 1);
        // Three copies in the first attempt, two in the restart.
        assert_eq!(backend.op_count("multipart_copy"), 5);
        assert_eq!(backend.open_uploads(), 0);
    }

    #[tokio::test]
    async fn test_part_copy_disabled_falls_back_to_upload() {
        let caps = Capabilities {
            supports_part_copy: false,
            ..tiny_caps()
        };
        let seeded = MemoryBackend::with_capabilities(caps);
        let payload: Vec<u8> = (0..48u8).collect();
        let out = seeded
            .put_blob(PutBlobRequest {
                key: key("big.bin"),
                data: payload.clone(),
                metadata: Metadata::new(),
                content_type: None,
            })
            .await
            .unwrap();

        let (backend, handle, pool) = multipart_rig(seeded);
        let file = FileSlot::new(InodeId::new(2), key("big.bin"), pool, None);
        file.adopt_remote(out.etag, Metadata::new(), 48);
        file.write(40, &[0xEE; 8], MAX).await.unwrap();

        handle.sync(&file).await.unwrap();

        let mut expected = payload;
        expected[40..].copy_from_slice(&[0xEE; 8]);
        assert_eq!(backend.object_bytes("big.bin").unwrap(), expected);
        // Every part was re-sent; the clean prefix was fetched first.
        assert_eq!(backend.op_count("multipart_copy"), 0);
        assert_eq!(backend.op_count("multipart_add"), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_sticks_and_reverts_buffers() {
        let backend = MemoryBackend::new();
        backend.inject_fault("put_blob", StoreError::Permission("denied".to_string()));
        let (_backend, handle, pool) = small_rig(backend);
        let file = FileSlot::new(InodeId::new(2), key("a.txt"), pool, None);
        file.write(0, b"data", MAX).await.unwrap();

        let err = handle.sync(&file).await.unwrap_err();
        assert!(matches!(err, FsError::Permission(_)));
        // The data is dirty again and the error sticks.
        assert_eq!(file.dirty_total(), 4);
        assert!(matches!(file.sticky(), Some(FsError::Permission(_))));
        assert!(matches!(
            handle.sync(&file).await,
            Err(FsError::Permission(_))
        ));

        // Close/reopen clears the sticky error and the data can flush.
        file.clear_sticky();
        handle.sync(&file).await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_only_change_uses_copy() {
        let (backend, handle, pool) = small_rig(MemoryBackend::new());
        let file = FileSlot::new(InodeId::new(2), key("a.txt"), pool, None);
        file.write(0, b"data", MAX).await.unwrap();
        handle.sync(&file).await.unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("dfs-mode".to_string(), "384".to_string());
        file.set_metadata(metadata.clone());

        let puts = backend.op_count("put_blob");
        handle.sync(&file).await.unwrap();
        assert_eq!(backend.op_count("put_blob"), puts);
        assert_eq!(backend.op_count("copy_blob"), 1);
        assert!(!file.needs_flush());

        let head = backend.head_blob(&key("a.txt")).await.unwrap();
        assert_eq!(head.metadata.get("dfs-mode").map(String::as_str), Some("384"));
    }

    #[tokio::test]
    async fn test_reaper_aborts_only_our_uploads() {
        let backend = MemoryBackend::new();
        let mut ours = Metadata::new();
        ours.insert(UPLOADER_META_KEY.to_string(), "driftfs".to_string());
        backend.multipart_begin(&key("a/ours.bin"), &ours).await.unwrap();
        backend
            .multipart_begin(&key("a/theirs.bin"), &Metadata::new())
            .await
            .unwrap();

        let reaped = reap_stale_uploads(&backend, "").await.unwrap();
        assert_eq!(reaped, 1);
        assert_eq!(backend.open_uploads(), 1);
    }

    #[tokio::test]
    async fn test_pressure_kick_drains_noted_files() {
        let (backend, handle, pool) = small_rig(MemoryBackend::new());
        let file = FileSlot::new(InodeId::new(2), key("a.txt"), Arc::clone(&pool), None);
        file.write(0, b"pressure", MAX).await.unwrap();
        handle.note_dirty(&file);

        handle.kick();
        for _ in 0..100 {
            if backend.contains("a.txt") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(backend.object_bytes("a.txt").unwrap(), b"pressure");
    }
}
