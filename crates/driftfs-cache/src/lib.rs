//! Buffer pool and page cache for DriftFS.
//!
//! A file inode owns an ordered list of byte-range buffers; the pool
//! enforces one global memory budget across every file with LRU eviction of
//! clean data, back-pressure on dirty data, and spill files for dirty data
//! squeezed out under pressure.
//!
//! This crate is pure data-plane state: it performs no backend I/O. The
//! flusher and fetcher in `driftfs-flush` drive the state transitions.

pub mod buffer;
pub mod list;
pub mod pool;
pub mod spill;

pub use buffer::{Buffer, BufferData, BufferState};
pub use list::{BufferList, FlushTicket, ReadSegment, Usage};
pub use pool::{BufferPool, Evictable, PoolStats};
pub use spill::SpillStore;
