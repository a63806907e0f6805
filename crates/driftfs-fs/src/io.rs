//! File I/O operations: open, read, write, flush, fsync, release.
//!
//! Writes land in the buffer pool and return immediately (modulo
//! back-pressure); reads go through the file slot's fetcher and feed the
//! prefetcher. `release` of the last handle is the close-to-open barrier:
//! it blocks until every dirty buffer reached the backend.

use std::time::SystemTime;

use driftfs_core::domain::{FsError, InodeId};
use tracing::debug;

use crate::fs::DriftFs;
use crate::handle::OpenHandle;
use crate::node::NodeState;

impl DriftFs {
    /// Opens a file and returns the handle id.
    pub async fn open(&self, ino: InodeId, write: bool) -> Result<u64, FsError> {
        let inode = self.table.resolve(ino)?;
        if inode.is_dir() {
            self.record_op("open", false);
            return Err(FsError::IsADirectory(inode.name()));
        }
        if inode.state() == NodeState::Deleted {
            self.record_op("open", false);
            return Err(FsError::NotFound(inode.name()));
        }
        inode.pin_open();
        let fh = self.alloc_fh();
        self.handles.insert(fh, OpenHandle::new(ino, write));
        self.record_op("open", true);
        Ok(fh)
    }

    /// Reads up to `size` bytes at `offset`. Short reads happen only at
    /// end of file.
    pub async fn read(
        &self,
        ino: InodeId,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, FsError> {
        let result = self.read_inner(ino, fh, offset, size).await;
        self.record_op("read", result.is_ok());
        result
    }

    async fn read_inner(
        &self,
        ino: InodeId,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, FsError> {
        let inode = self.table.resolve(ino)?;
        let slot = inode
            .file
            .as_ref()
            .ok_or_else(|| FsError::IsADirectory(inode.name()))?;

        let bytes = slot.read(self.backend.as_ref(), offset, size as u64).await?;

        // Feed the sequential-read detector for this handle.
        if let Some(handle) = self.handles.get(&fh) {
            let mut state = handle.read_ahead.lock().unwrap();
            self.prefetcher
                .observe_read(slot, &mut state, offset, bytes.len() as u64);
        }

        self.metrics
            .transfer_bytes_total
            .with_label_values(&["download"])
            .inc_by(bytes.len() as u64);
        inode.meta.write().unwrap().attr.atime = SystemTime::now();
        Ok(bytes)
    }

    /// Applies a write and schedules background flushing when the file
    /// crosses the multipart threshold.
    pub async fn write(
        &self,
        ino: InodeId,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, FsError> {
        let result = self.write_inner(ino, fh, offset, data).await;
        self.record_op("write", result.is_ok());
        result
    }

    async fn write_inner(
        &self,
        ino: InodeId,
        fh: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<u32, FsError> {
        let inode = self.table.resolve(ino)?;
        let slot = inode
            .file
            .as_ref()
            .ok_or_else(|| FsError::IsADirectory(inode.name()))?;

        match self.handles.get(&fh) {
            Some(handle) if handle.write => {}
            Some(_) => {
                return Err(FsError::Permission(
                    "write on read-only handle".to_string(),
                ))
            }
            None => return Err(FsError::Invalid(format!("unknown file handle {fh}"))),
        }

        let max_buffer = self.write_buffer_limit();
        slot.write(offset, data, max_buffer).await?;
        self.flusher.note_dirty(slot);

        {
            let mut meta = inode.meta.write().unwrap();
            meta.attr.size = meta.attr.size.max(offset + data.len() as u64);
            meta.attr.touch_modified();
            if meta.state == NodeState::Clean {
                meta.state = NodeState::Modified;
            }
        }

        // Start shipping parts early once the file is multipart-sized.
        if slot.size() >= self.config.flush.multipart_threshold_mb * 1024 * 1024 {
            self.flusher.drain(slot);
        }

        self.metrics
            .transfer_bytes_total
            .with_label_values(&["buffered"])
            .inc_by(data.len() as u64);
        Ok(data.len() as u32)
    }

    /// A single dirty buffer never exceeds the multipart part size.
    fn write_buffer_limit(&self) -> u64 {
        (self.config.flush.part_size_mb * 1024 * 1024)
            .clamp(self.caps.min_part_size, self.caps.max_part_size)
    }

    /// Drains the file to the backend and waits. flush and fsync behave
    /// identically.
    pub async fn flush(&self, ino: InodeId) -> Result<(), FsError> {
        let result = self.sync_inode(ino).await;
        self.record_op("flush", result.is_ok());
        result
    }

    pub async fn fsync(&self, ino: InodeId) -> Result<(), FsError> {
        let result = self.sync_inode(ino).await;
        self.record_op("fsync", result.is_ok());
        result
    }

    async fn sync_inode(&self, ino: InodeId) -> Result<(), FsError> {
        let inode = self.table.resolve(ino)?;
        let Some(slot) = &inode.file else {
            return Ok(());
        };
        if inode.state() == NodeState::Deleted {
            return Ok(());
        }
        let outcome = self.flusher.sync(slot).await?;
        self.apply_flush_outcome(&inode, &outcome);
        Ok(())
    }

    /// Closes a handle. The last close blocks until the file is clean and
    /// then clears any sticky error, so a reopen starts fresh.
    pub async fn release(&self, ino: InodeId, fh: u64) -> Result<(), FsError> {
        let result = self.release_inner(ino, fh).await;
        self.record_op("release", result.is_ok());
        result
    }

    async fn release_inner(&self, ino: InodeId, fh: u64) -> Result<(), FsError> {
        self.handles.remove(&fh);
        let inode = self.table.resolve(ino)?;
        let remaining = inode.unpin_open();
        if remaining > 0 {
            return Ok(());
        }

        // Closing is the way out of a wedged file: drop the sticky error
        // so this final flush gets a fresh attempt, and leave the inode
        // unwedged for a reopen even if that attempt fails too.
        if let Some(slot) = &inode.file {
            slot.clear_sticky();
        }
        let result = if inode.state() == NodeState::Deleted {
            Ok(())
        } else {
            self.sync_inode(ino).await
        };
        if let Some(slot) = &inode.file {
            slot.clear_sticky();
        }
        debug!(ino = %inode.id, ok = result.is_ok(), "last handle released");
        self.try_reclaim(&inode);
        result
    }
}
