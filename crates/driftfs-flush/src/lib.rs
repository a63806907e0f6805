//! Background I/O pipeline of DriftFS.
//!
//! Three pieces cooperate around the per-file [`FileSlot`]:
//!
//! - the **fetcher** (on [`FileSlot`]) populates missing clean ranges from
//!   the backend, deduplicating concurrent fetches of the same range
//! - the **flusher** realises dirty buffers into backend writes: one PUT
//!   for small files, a multipart upload machine for large ones
//! - the **prefetcher** detects sequential reads and runs a bounded chain
//!   of ranged GETs ahead of the cursor
//!
//! All of them suspend only outside the file lock; the lock is taken to
//! plan and to install results, never across a backend call.

pub mod file;
pub mod flusher;
pub mod multipart;
pub mod prefetch;

pub use file::{FileSlot, FlushOutcome, RemoteState, Snapshot};
pub use flusher::{Flusher, FlusherHandle};
pub use multipart::MultipartState;
pub use prefetch::{Prefetcher, ReadAhead};
