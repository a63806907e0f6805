//! The inode: one node of the filesystem tree.
//!
//! Metadata sits behind its own lock; a directory's child map behind
//! another; file data lives in the shared [`FileSlot`] with its own mutex.
//! Lock order is always metadata before child map before file state, and
//! ancestor before descendant.
//!
//! The `parent` field is a plain id, resolved through the table and the
//! parent's child map. Nothing owns an inode except the table, so the tree
//! cannot form reference cycles.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use driftfs_core::domain::{Etag, InodeAttr, InodeId, InodeKind};
use driftfs_flush::FileSlot;

/// Lifecycle state of an inode relative to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// In sync with the backend as last observed.
    Clean,
    /// Local changes not yet flushed.
    Modified,
    /// Created locally; no backend object yet.
    NewFile,
    /// Unlinked; lingers until the kernel forgets it.
    Deleted,
    /// Moved in the graph; the backend move is still in flight.
    Renamed,
}

/// Freshness of a directory's cached listing.
#[derive(Debug, Clone)]
pub enum ListingState {
    /// Never listed.
    Unlisted,
    /// A listing is underway; more pages remain.
    Partial {
        continuation: String,
        fetched_at: Instant,
    },
    /// Fully listed at `fetched_at`; stale after the TTL or any write
    /// under the prefix.
    Complete { fetched_at: Instant },
}

/// Mutable metadata of an inode.
#[derive(Debug)]
pub struct InodeMeta {
    pub name: String,
    pub parent: InodeId,
    pub attr: InodeAttr,
    pub etag: Option<Etag>,
    pub storage_class: Option<String>,
    pub state: NodeState,
    pub symlink_target: Option<String>,
    pub xattrs: BTreeMap<String, String>,
}

/// Directory-only state.
#[derive(Debug, Default)]
pub struct DirState {
    /// name -> child inode id.
    pub children: RwLock<BTreeMap<String, InodeId>>,
    pub listing: Mutex<ListingState>,
}

impl Default for ListingState {
    fn default() -> Self {
        ListingState::Unlisted
    }
}

/// One filesystem object.
pub struct Inode {
    pub id: InodeId,
    kind: InodeKind,
    pub meta: RwLock<InodeMeta>,
    /// Kernel lookup references.
    lookups: AtomicU64,
    /// Open file handles.
    opens: AtomicU64,
    /// Present for regular files.
    pub file: Option<Arc<FileSlot>>,
    /// Present for directories.
    pub dir: Option<DirState>,
}

impl Inode {
    pub fn new(
        id: InodeId,
        name: String,
        parent: InodeId,
        attr: InodeAttr,
        state: NodeState,
        file: Option<Arc<FileSlot>>,
    ) -> Arc<Self> {
        let kind = attr.kind;
        Arc::new(Self {
            id,
            kind,
            meta: RwLock::new(InodeMeta {
                name,
                parent,
                attr,
                etag: None,
                storage_class: None,
                state,
                symlink_target: None,
                xattrs: BTreeMap::new(),
            }),
            lookups: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            file,
            dir: match kind {
                InodeKind::Directory => Some(DirState::default()),
                _ => None,
            },
        })
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }

    /// The directory state; errors are for callers to map to `ENOTDIR`.
    pub fn dir_state(&self) -> Option<&DirState> {
        self.dir.as_ref()
    }

    pub fn state(&self) -> NodeState {
        self.meta.read().unwrap().state
    }

    pub fn set_state(&self, state: NodeState) {
        self.meta.write().unwrap().state = state;
    }

    pub fn name(&self) -> String {
        self.meta.read().unwrap().name.clone()
    }

    pub fn parent_id(&self) -> InodeId {
        self.meta.read().unwrap().parent
    }

    pub fn attr(&self) -> InodeAttr {
        self.meta.read().unwrap().attr.clone()
    }

    // ------------------------------------------------------------------
    // Reference counting
    // ------------------------------------------------------------------

    pub fn pin_lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unpin_lookup(&self, count: u64) -> u64 {
        let mut current = self.lookups.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(count);
            match self.lookups.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn pin_open(&self) {
        self.opens.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the remaining open count.
    pub fn unpin_open(&self) -> u64 {
        self.opens.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// True when nothing pins the inode and its state allows reclaiming.
    pub fn reclaimable(&self) -> bool {
        if self.id.is_root() {
            return false;
        }
        if self.lookups.load(Ordering::Relaxed) != 0 || self.opens.load(Ordering::Relaxed) != 0 {
            return false;
        }
        matches!(self.state(), NodeState::Clean | NodeState::Deleted)
    }
}
