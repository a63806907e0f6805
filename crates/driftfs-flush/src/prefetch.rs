//! Sequential read-ahead.
//!
//! Two consecutive contiguous reads on one handle mark the stream as
//! sequential; the prefetcher then keeps a window of data ahead of the
//! cursor, doubling it on every hit up to a ceiling and resetting it on
//! seek. The window is fetched by a background chain of ranged GETs that
//! reuses the shared missing-range fetcher, so an overlapping foreground
//! read never duplicates a request.

use std::sync::Arc;

use driftfs_core::config::ReadAheadConfig;
use driftfs_core::ports::ObjectBackend;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::file::FileSlot;

/// Concurrent prefetch chains across the whole mount.
const MAX_CHAINS: usize = 8;

/// Per-handle read-ahead cursor state.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadAhead {
    /// End offset of the previous read, `None` before the first read.
    last_end: Option<u64>,
    /// Current read-ahead window; 0 until a sequential pattern is seen.
    window: u64,
}

/// Issues background ranged GETs ahead of sequential readers.
pub struct Prefetcher {
    backend: Arc<dyn ObjectBackend>,
    config: ReadAheadConfig,
    chains: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Prefetcher {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        config: ReadAheadConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            config,
            chains: Arc::new(Semaphore::new(MAX_CHAINS)),
            cancel,
        }
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window_kb * 1024
    }

    fn max_window(&self) -> u64 {
        self.config.max_window_mb * 1024 * 1024
    }

    /// Feeds one read into the per-handle state, spawning a prefetch chain
    /// when the pattern is sequential.
    pub fn observe_read(
        &self,
        file: &Arc<FileSlot>,
        state: &mut ReadAhead,
        offset: u64,
        len: u64,
    ) {
        let read_end = offset + len;
        let sequential = state.last_end == Some(offset);
        state.last_end = Some(read_end);

        if !sequential {
            // Seek: drop back to cold.
            state.window = 0;
            return;
        }

        state.window = if state.window == 0 {
            self.initial_window()
        } else {
            (state.window * 2).min(self.max_window())
        };

        let fetch_end = read_end
            .saturating_add(state.window)
            .min(file.size());
        if fetch_end <= read_end {
            return;
        }
        self.spawn_chain(Arc::clone(file), read_end, fetch_end);
    }

    /// Runs a bounded chain of chunked fetches for `[start, end)`.
    fn spawn_chain(&self, file: Arc<FileSlot>, start: u64, end: u64) {
        let Ok(permit) = Arc::clone(&self.chains).try_acquire_owned() else {
            // All chains busy; the reader will fetch on demand.
            return;
        };
        let backend = Arc::clone(&self.backend);
        let cancel = self.cancel.clone();
        let chunk = (self.config.chunk_kb * 1024).max(1);
        tokio::spawn(async move {
            let _permit = permit;
            let mut cursor = start;
            while cursor < end && !cancel.is_cancelled() {
                let chunk_end = (cursor + chunk).min(end);
                if file
                    .fetch_missing(backend.as_ref(), cursor, chunk_end)
                    .await
                    .is_err()
                {
                    break;
                }
                trace!(ino = %file.ino(), cursor, chunk_end, "prefetched range");
                cursor = chunk_end;
            }
        });
    }
}
