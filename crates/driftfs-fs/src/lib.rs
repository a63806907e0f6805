//! DriftFS filesystem core.
//!
//! Projects an object store as a POSIX filesystem: the inode graph, the
//! directory listing cache, rename over a flat key space, and the typed
//! operation surface a FUSE adapter drives. Data caching and background
//! I/O live in `driftfs-cache` and `driftfs-flush`; this crate ties them
//! to the tree.

pub mod error;
pub mod fs;
pub mod handle;
pub mod io;
pub mod listing;
pub mod meta;
pub mod node;
pub mod rename;
pub mod table;

pub use error::errno;
pub use fs::{DirEntry, DriftFs, EntryOut, FsStats};
pub use node::{Inode, ListingState, NodeState};
pub use table::InodeTable;
