//! Inode table: id allocation and id -> inode resolution.
//!
//! A `DashMap` keeps lookups lock-free across FUSE worker threads. The
//! table is the only owner of inodes; directories reference children by
//! id, so dropping a table entry is what actually frees a node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use driftfs_core::domain::{FsError, InodeAttr, InodeId};
use driftfs_flush::FileSlot;

use crate::node::{Inode, NodeState};

pub struct InodeTable {
    by_id: DashMap<u64, Arc<Inode>>,
    next_id: AtomicU64,
}

impl InodeTable {
    /// Creates a table holding only the mount root.
    pub fn new(root_attr: InodeAttr) -> Self {
        let table = Self {
            by_id: DashMap::new(),
            next_id: AtomicU64::new(2),
        };
        let root = Inode::new(
            InodeId::ROOT,
            String::new(),
            InodeId::ROOT,
            root_attr,
            NodeState::Clean,
            None,
        );
        table.by_id.insert(InodeId::ROOT.get(), root);
        table
    }

    /// Allocates the next dense inode id.
    pub fn allocate_id(&self) -> InodeId {
        InodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates and registers a new inode.
    pub fn insert(
        &self,
        name: String,
        parent: InodeId,
        attr: InodeAttr,
        state: NodeState,
        file: Option<Arc<FileSlot>>,
    ) -> Arc<Inode> {
        let id = self.allocate_id();
        let inode = Inode::new(id, name, parent, attr, state, file);
        self.by_id.insert(id.get(), Arc::clone(&inode));
        inode
    }

    /// Registers an inode built by the caller (used when the id must be
    /// known before construction, e.g. to create the file slot).
    pub fn register(&self, inode: Arc<Inode>) {
        self.by_id.insert(inode.id.get(), inode);
    }

    pub fn get(&self, id: InodeId) -> Option<Arc<Inode>> {
        self.by_id.get(&id.get()).map(|r| Arc::clone(&r))
    }

    /// Like [`get`](Self::get) but with the error every operation wants.
    pub fn resolve(&self, id: InodeId) -> Result<Arc<Inode>, FsError> {
        self.get(id)
            .ok_or_else(|| FsError::NotFound(format!("inode {id}")))
    }

    pub fn root(&self) -> Arc<Inode> {
        self.get(InodeId::ROOT).expect("root inode always present")
    }

    pub fn remove(&self, id: InodeId) -> Option<Arc<Inode>> {
        self.by_id.remove(&id.get()).map(|(_, inode)| inode)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Snapshot of every inode, for unmount sweeps.
    pub fn all(&self) -> Vec<Arc<Inode>> {
        self.by_id.iter().map(|r| Arc::clone(r.value())).collect()
    }
}
