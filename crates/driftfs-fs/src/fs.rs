//! The filesystem facade.
//!
//! `DriftFs` owns the inode graph and wires the buffer pool, flusher and
//! prefetcher together. Every method corresponds to one kernel upcall and
//! returns a typed result; the FUSE adapter maps errors to errno via
//! [`crate::error::errno`].
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           DriftFs                              │
//! │  ┌────────────┐  ┌─────────────┐  ┌──────────┐  ┌──────────┐  │
//! │  │ InodeTable │  │ BufferPool  │  │ Flusher  │  │Prefetcher│  │
//! │  │ (tree)     │  │ (budget/LRU)│  │ (workers)│  │ (chains) │  │
//! │  └────────────┘  └─────────────┘  └──────────┘  └──────────┘  │
//! │         │               │              │             │        │
//! │         └───────────────┴──────┬───────┴─────────────┘        │
//! │                                ▼                              │
//! │                       ObjectBackend (port)                    │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use driftfs_cache::{BufferPool, SpillStore};
use driftfs_core::config::MountConfig;
use driftfs_core::domain::newtypes::NAME_MAX;
use driftfs_core::domain::{Etag, FsError, InodeAttr, InodeId, InodeKind, ObjectKey, SetAttr};
use driftfs_core::metrics::MetricsRegistry;
use driftfs_core::ports::{
    Capabilities, DirMarkerScheme, Metadata, ObjectBackend, PutBlobRequest, StoreError,
};
use driftfs_flush::{flusher::reap_stale_uploads, FileSlot, Flusher, FlusherHandle, Prefetcher};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handle::OpenHandle;
use crate::meta::{decode_attr, encode_attr};
use crate::node::{Inode, NodeState};
use crate::table::InodeTable;

/// Time the orderly unmount grants the final flush sweep.
const UNMOUNT_DEADLINE: Duration = Duration::from_secs(30);

/// Reply to lookup/create/mkdir/symlink.
#[derive(Debug, Clone)]
pub struct EntryOut {
    pub ino: InodeId,
    pub attr: InodeAttr,
    pub etag: Option<Etag>,
}

/// One directory entry as returned by readdir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub ino: InodeId,
    pub kind: InodeKind,
}

/// Filesystem-wide statistics for statfs.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub budget_bytes: u64,
    pub cached_bytes: u64,
    pub dirty_bytes: u64,
    pub inodes: u64,
}

/// The in-memory filesystem over one bucket.
pub struct DriftFs {
    pub(crate) backend: Arc<dyn ObjectBackend>,
    pub(crate) caps: Capabilities,
    pub(crate) config: MountConfig,
    pub(crate) table: InodeTable,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) flusher: FlusherHandle,
    pub(crate) prefetcher: Prefetcher,
    pub(crate) spill: Option<Arc<SpillStore>>,
    pub(crate) metrics: Arc<MetricsRegistry>,
    pub(crate) handles: DashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
    /// Background jobs: deletes, marker writes, rename executions.
    jobs: Mutex<JoinSet<()>>,
    /// Serialises backend copies per destination key.
    pub(crate) copy_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    pub(crate) cancel: CancellationToken,
}

impl DriftFs {
    /// Builds the filesystem over a backend and starts its workers.
    pub async fn mount(
        backend: Arc<dyn ObjectBackend>,
        config: MountConfig,
    ) -> Result<Arc<Self>, FsError> {
        let caps = backend.capabilities();
        let metrics = Arc::new(
            MetricsRegistry::new().map_err(|err| FsError::Invalid(err.to_string()))?,
        );

        let pool = BufferPool::new(&config.cache);
        pool.set_metrics(Arc::clone(&metrics));

        let spill = match &config.cache.spill_dir {
            Some(dir) => {
                let store = Arc::new(SpillStore::new(dir.clone())?);
                match store.scan() {
                    Ok(leftovers) if !leftovers.is_empty() => {
                        warn!(
                            count = leftovers.len(),
                            "found spill files from an unclean shutdown, discarding"
                        );
                        store.cleanup();
                    }
                    Ok(_) => {}
                    Err(err) => warn!(%err, "spill directory scan failed"),
                }
                Some(store)
            }
            None => None,
        };

        let (flusher, flusher_handle) = Flusher::new(
            Arc::clone(&backend),
            config.flush.clone(),
            Arc::clone(&pool),
            Some(Arc::clone(&metrics)),
        );
        tokio::spawn(flusher.run());

        {
            let handle = flusher_handle.clone();
            pool.set_pressure_hook(Box::new(move || handle.kick()));
        }

        let cancel = CancellationToken::new();
        let prefetcher = Prefetcher::new(
            Arc::clone(&backend),
            config.read_ahead.clone(),
            cancel.child_token(),
        );

        match reap_stale_uploads(backend.as_ref(), "").await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "aborted stale multipart uploads at mount"),
            Err(err) => warn!(%err, "stale upload scan failed"),
        }

        info!("driftfs mounted");
        Ok(Arc::new(Self {
            backend,
            caps,
            config,
            table: InodeTable::new(InodeAttr::directory(0o755, 0, 0)),
            pool,
            flusher: flusher_handle,
            prefetcher,
            spill,
            metrics,
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
            jobs: Mutex::new(JoinSet::new()),
            copy_locks: DashMap::new(),
            cancel,
        }))
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    // ========================================================================
    // Internal plumbing
    // ========================================================================

    pub(crate) fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn record_op(&self, op: &'static str, ok: bool) {
        self.metrics
            .fs_operations_total
            .with_label_values(&[op, if ok { "ok" } else { "error" }])
            .inc();
    }

    /// Spawns a tracked background job, drained at unmount.
    pub(crate) fn spawn_job(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.jobs.lock().unwrap().spawn(future);
    }

    /// Waits for every tracked background job. Tests use this to observe
    /// the backend after asynchronous deletes and renames.
    pub async fn drain_background(&self) {
        loop {
            let joined = self.jobs.lock().unwrap().try_join_next();
            match joined {
                Some(_) => continue,
                None => {
                    if self.jobs.lock().unwrap().is_empty() {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    }

    /// Full object key of an inode, assembled from ancestor names.
    pub(crate) fn key_of(&self, inode: &Arc<Inode>) -> Result<ObjectKey, FsError> {
        if inode.id.is_root() {
            return Ok(ObjectKey::root());
        }
        let mut segments = Vec::new();
        let mut current = Arc::clone(inode);
        while !current.id.is_root() {
            let (name, parent) = {
                let meta = current.meta.read().unwrap();
                (meta.name.clone(), meta.parent)
            };
            segments.push(name);
            if segments.len() > 256 {
                return Err(FsError::Invalid("path depth limit exceeded".to_string()));
            }
            current = self.table.resolve(parent)?;
        }
        let mut key = ObjectKey::root();
        for segment in segments.iter().rev() {
            key = key.child(segment)?;
        }
        Ok(key)
    }

    pub(crate) fn child_of(&self, dir: &Inode, name: &str) -> Option<Arc<Inode>> {
        let dir_state = dir.dir_state()?;
        let id = *dir_state.children.read().unwrap().get(name)?;
        self.table.get(id)
    }

    pub(crate) fn require_dir<'a>(
        &self,
        inode: &'a Arc<Inode>,
    ) -> Result<&'a crate::node::DirState, FsError> {
        inode
            .dir_state()
            .ok_or_else(|| FsError::NotADirectory(inode.name()))
    }

    fn validate_name(name: &str) -> Result<(), FsError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(FsError::Invalid(format!("invalid name: {name}")));
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        Ok(())
    }

    fn entry_out(inode: &Arc<Inode>) -> EntryOut {
        let meta = inode.meta.read().unwrap();
        EntryOut {
            ino: inode.id,
            attr: meta.attr.clone(),
            etag: meta.etag.clone(),
        }
    }

    /// Registers a child discovered on the backend, de-duplicating against
    /// a racing discovery of the same name.
    pub(crate) fn materialize_child(
        &self,
        dir: &Arc<Inode>,
        name: &str,
        attr: InodeAttr,
        etag: Option<Etag>,
        storage_class: Option<String>,
        symlink_target: Option<String>,
        adopt: Option<(Etag, Metadata, u64)>,
    ) -> Result<Arc<Inode>, FsError> {
        let dir_state = self.require_dir(dir)?;
        let key = self.key_of(dir)?.child(name)?;

        let id = self.table.allocate_id();
        let slot = if attr.kind == InodeKind::File {
            let slot = FileSlot::new(id, key, Arc::clone(&self.pool), self.spill.clone());
            if let Some((etag, metadata, size)) = adopt {
                slot.adopt_remote(etag, metadata, size);
            }
            Some(slot)
        } else {
            None
        };
        let inode = Inode::new(id, name.to_string(), dir.id, attr, NodeState::Clean, slot);
        {
            let mut meta = inode.meta.write().unwrap();
            meta.etag = etag;
            meta.storage_class = storage_class;
            meta.symlink_target = symlink_target;
        }

        // Double-checked under the write lock: a concurrent probe may have
        // beaten us here; its inode wins and ours is dropped unused.
        let mut children = dir_state.children.write().unwrap();
        if let Some(&existing) = children.get(name) {
            if let Some(existing) = self.table.get(existing) {
                return Ok(existing);
            }
        }
        self.table.register(Arc::clone(&inode));
        children.insert(name.to_string(), id);
        Ok(inode)
    }

    // ========================================================================
    // Lookup / attributes
    // ========================================================================

    /// Resolves `name` under `parent`, probing the backend for objects not
    /// yet materialised locally. Pins a kernel lookup reference.
    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<EntryOut, FsError> {
        let result = self.lookup_inner(parent, name).await;
        self.record_op("lookup", result.is_ok());
        result
    }

    async fn lookup_inner(&self, parent: InodeId, name: &str) -> Result<EntryOut, FsError> {
        Self::validate_name(name)?;
        let dir = self.table.resolve(parent)?;
        self.require_dir(&dir)?;

        if let Some(child) = self.child_of(&dir, name) {
            if child.state() == NodeState::Deleted {
                return Err(FsError::NotFound(name.to_string()));
            }
            child.pin_lookup();
            return Ok(Self::entry_out(&child));
        }
        if self.listing_fresh(&dir) {
            // The listing is authoritative; no probe needed.
            return Err(FsError::NotFound(name.to_string()));
        }

        let child = self.probe_remote(&dir, name).await?;
        child.pin_lookup();
        Ok(Self::entry_out(&child))
    }

    /// Single-object discovery: head the key, then the directory marker,
    /// then fall back to a one-key prefix listing for implicit directories.
    async fn probe_remote(&self, dir: &Arc<Inode>, name: &str) -> Result<Arc<Inode>, FsError> {
        let key = self.key_of(dir)?.child(name)?;

        match self.backend.head_blob(&key).await {
            Ok(head) => {
                if head.is_directory_marker {
                    return self.materialize_child(
                        dir,
                        name,
                        InodeAttr::directory(0o755, 0, 0),
                        Some(head.etag),
                        head.storage_class,
                        None,
                        None,
                    );
                }
                let decoded = decode_attr(&head.metadata);
                if let Some(target) = decoded.symlink_target {
                    let mut attr = InodeAttr::symlink(
                        decoded.uid.unwrap_or(0),
                        decoded.gid.unwrap_or(0),
                    );
                    attr.size = target.len() as u64;
                    return self.materialize_child(
                        dir,
                        name,
                        attr,
                        Some(head.etag),
                        head.storage_class,
                        Some(target),
                        None,
                    );
                }
                let mut attr = InodeAttr::file(
                    decoded.mode.unwrap_or(0o644),
                    decoded.uid.unwrap_or(0),
                    decoded.gid.unwrap_or(0),
                );
                attr.size = head.size;
                if let Some(mtime) = decoded.mtime {
                    attr.mtime = mtime;
                } else {
                    attr.mtime = SystemTime::from(head.mtime);
                }
                let inode = self.materialize_child(
                    dir,
                    name,
                    attr,
                    Some(head.etag.clone()),
                    head.storage_class.clone(),
                    None,
                    Some((head.etag, head.metadata, head.size)),
                )?;
                {
                    let mut meta = inode.meta.write().unwrap();
                    let decoded_xattrs = decoded.xattrs;
                    if !decoded_xattrs.is_empty() {
                        meta.xattrs = decoded_xattrs;
                    }
                }
                Ok(inode)
            }
            Err(StoreError::NotFound(_)) => {
                // A directory marker blob?
                if self.caps.dir_markers == DirMarkerScheme::EmptyBlob {
                    if let Ok(head) = self.backend.head_blob(&key.marker()).await {
                        return self.materialize_child(
                            dir,
                            name,
                            InodeAttr::directory(0o755, 0, 0),
                            Some(head.etag),
                            head.storage_class,
                            None,
                            None,
                        );
                    }
                }
                // An implicit directory (common prefix of other keys)?
                let probe = self
                    .backend
                    .list_blobs(&driftfs_core::ports::ListBlobsRequest {
                        prefix: key.dir_prefix(),
                        delimiter: None,
                        continuation: None,
                        max_keys: 1,
                    })
                    .await
                    .map_err(FsError::from)?;
                if !probe.items.is_empty() || !probe.common_prefixes.is_empty() {
                    return self.materialize_child(
                        dir,
                        name,
                        InodeAttr::directory(0o755, 0, 0),
                        None,
                        None,
                        None,
                        None,
                    );
                }
                Err(FsError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Drops kernel lookup references and reclaims the inode when nothing
    /// pins it anymore.
    pub fn forget(&self, ino: InodeId, nlookups: u64) {
        let Some(inode) = self.table.get(ino) else {
            return;
        };
        inode.unpin_lookup(nlookups);
        self.try_reclaim(&inode);
    }

    pub(crate) fn try_reclaim(&self, inode: &Arc<Inode>) {
        if !inode.reclaimable() {
            return;
        }
        // Remove from the parent's map unless the entry was replaced.
        if inode.state() != NodeState::Deleted {
            if let Ok(parent) = self.table.resolve(inode.parent_id()) {
                if let Some(dir_state) = parent.dir_state() {
                    let mut children = dir_state.children.write().unwrap();
                    if children.get(&inode.name()) == Some(&inode.id) {
                        children.remove(&inode.name());
                    }
                }
            }
        }
        debug!(ino = %inode.id, "reclaiming inode");
        self.table.remove(inode.id);
    }

    pub fn getattr(&self, ino: InodeId) -> Result<InodeAttr, FsError> {
        let inode = self.table.resolve(ino)?;
        self.record_op("getattr", true);
        Ok(inode.attr())
    }

    /// Applies chmod/chown/truncate/utimens. Attribute changes ride along
    /// as object metadata on the next flush.
    pub async fn setattr(&self, ino: InodeId, changes: SetAttr) -> Result<InodeAttr, FsError> {
        let result = self.setattr_inner(ino, changes).await;
        self.record_op("setattr", result.is_ok());
        result
    }

    async fn setattr_inner(&self, ino: InodeId, changes: SetAttr) -> Result<InodeAttr, FsError> {
        let inode = self.table.resolve(ino)?;

        if let Some(size) = changes.size {
            let slot = inode
                .file
                .as_ref()
                .ok_or_else(|| FsError::IsADirectory(inode.name()))?;
            slot.truncate(size)?;
            self.flusher.note_dirty(slot);
        }

        let attr = {
            let mut meta = inode.meta.write().unwrap();
            if let Some(mode) = changes.mode {
                meta.attr.mode = mode & 0o7777;
            }
            if let Some(uid) = changes.uid {
                meta.attr.uid = uid;
            }
            if let Some(gid) = changes.gid {
                meta.attr.gid = gid;
            }
            if let Some(size) = changes.size {
                meta.attr.size = size;
            }
            if let Some(mtime) = changes.mtime {
                meta.attr.mtime = mtime;
            }
            if let Some(atime) = changes.atime {
                meta.attr.atime = atime;
            }
            meta.attr.ctime = SystemTime::now();
            if meta.state == NodeState::Clean {
                meta.state = NodeState::Modified;
            }
            meta.attr.clone()
        };

        if let Some(slot) = &inode.file {
            let (xattrs, target) = {
                let meta = inode.meta.read().unwrap();
                (meta.xattrs.clone(), meta.symlink_target.clone())
            };
            slot.set_metadata(encode_attr(&attr, &xattrs, target.as_deref()));
            self.flusher.note_dirty(slot);
        }
        Ok(attr)
    }

    // ========================================================================
    // Namespace mutations
    // ========================================================================

    /// Creates a regular file. No backend call happens until flush.
    pub async fn create(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(EntryOut, u64), FsError> {
        let result = self.create_inner(parent, name, mode, uid, gid).await;
        self.record_op("create", result.is_ok());
        result
    }

    async fn create_inner(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(EntryOut, u64), FsError> {
        Self::validate_name(name)?;
        let dir = self.table.resolve(parent)?;
        let dir_state = self.require_dir(&dir)?;

        if let Some(existing) = self.child_of(&dir, name) {
            if existing.state() != NodeState::Deleted {
                return Err(FsError::Exists(name.to_string()));
            }
        } else if !self.listing_fresh(&dir) {
            // The name may exist remotely without being materialised.
            match self.probe_remote(&dir, name).await {
                Ok(_) => return Err(FsError::Exists(name.to_string())),
                Err(FsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let key = self.key_of(&dir)?.child(name)?;
        let mut attr = InodeAttr::file(mode & 0o7777, uid, gid);
        attr.touch_modified();

        let id = self.table.allocate_id();
        let slot = FileSlot::new(id, key, Arc::clone(&self.pool), self.spill.clone());
        slot.set_metadata(encode_attr(&attr, &BTreeMap::new(), None));
        let inode = Inode::new(id, name.to_string(), dir.id, attr, NodeState::NewFile, Some(slot));
        self.table.register(Arc::clone(&inode));

        {
            let mut children = dir_state.children.write().unwrap();
            if children.contains_key(name) {
                self.table.remove(id);
                return Err(FsError::Exists(name.to_string()));
            }
            children.insert(name.to_string(), id);
        }
        self.mark_listing_stale(&dir);

        inode.pin_lookup();
        inode.pin_open();
        let fh = self.alloc_fh();
        self.handles.insert(fh, OpenHandle::new(inode.id, true));
        debug!(ino = %inode.id, name, "created file");
        Ok((Self::entry_out(&inode), fh))
    }

    /// Creates a directory; the marker blob (where the backend needs one)
    /// is written in the background.
    pub async fn mkdir(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut, FsError> {
        let result = self.mkdir_inner(parent, name, mode, uid, gid).await;
        self.record_op("mkdir", result.is_ok());
        result
    }

    async fn mkdir_inner(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut, FsError> {
        Self::validate_name(name)?;
        let dir = self.table.resolve(parent)?;
        let dir_state = self.require_dir(&dir)?;

        if self.child_of(&dir, name).map(|c| c.state()) == Some(NodeState::Deleted) {
            // fall through, name is free again
        } else if self.child_of(&dir, name).is_some() {
            return Err(FsError::Exists(name.to_string()));
        } else if !self.listing_fresh(&dir) {
            match self.probe_remote(&dir, name).await {
                Ok(_) => return Err(FsError::Exists(name.to_string())),
                Err(FsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let attr = InodeAttr::directory(mode & 0o7777, uid, gid);
        let inode = self.table.insert(
            name.to_string(),
            dir.id,
            attr.clone(),
            NodeState::NewFile,
            None,
        );
        {
            let mut children = dir_state.children.write().unwrap();
            if children.contains_key(name) {
                self.table.remove(inode.id);
                return Err(FsError::Exists(name.to_string()));
            }
            children.insert(name.to_string(), inode.id);
        }
        self.mark_listing_stale(&dir);

        if self.caps.dir_markers == DirMarkerScheme::EmptyBlob {
            let marker = self.key_of(&inode)?.marker();
            let metadata = encode_attr(&attr, &BTreeMap::new(), None);
            let backend = Arc::clone(&self.backend);
            let node = Arc::clone(&inode);
            self.spawn_job(async move {
                match backend
                    .put_blob(PutBlobRequest {
                        key: marker.clone(),
                        data: Vec::new(),
                        metadata,
                        content_type: None,
                    })
                    .await
                {
                    Ok(output) => {
                        let mut meta = node.meta.write().unwrap();
                        meta.etag = Some(output.etag);
                        if meta.state == NodeState::NewFile {
                            meta.state = NodeState::Clean;
                        }
                    }
                    Err(err) => warn!(key = %marker, %err, "directory marker write failed"),
                }
            });
        }

        inode.pin_lookup();
        Ok(Self::entry_out(&inode))
    }

    /// Removes a file or symlink; the backend delete runs asynchronously.
    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        let result = self.unlink_inner(parent, name).await;
        self.record_op("unlink", result.is_ok());
        result
    }

    async fn unlink_inner(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        let dir = self.table.resolve(parent)?;
        let dir_state = self.require_dir(&dir)?;

        let child = match self.child_of(&dir, name) {
            Some(child) if child.state() != NodeState::Deleted => child,
            _ => {
                if self.listing_fresh(&dir) {
                    return Err(FsError::NotFound(name.to_string()));
                }
                self.probe_remote(&dir, name).await?
            }
        };
        if child.is_dir() {
            return Err(FsError::IsADirectory(name.to_string()));
        }

        {
            let mut children = dir_state.children.write().unwrap();
            if children.get(name) == Some(&child.id) {
                children.remove(name);
            }
        }
        child.set_state(NodeState::Deleted);
        self.mark_listing_stale(&dir);

        // Tear down any in-flight upload and delete the object.
        let key = match &child.file {
            Some(slot) => {
                slot.clear_sticky();
                let remote = slot.remote();
                if let Some((upload_key, upload_id)) = slot.take_failed_upload() {
                    let backend = Arc::clone(&self.backend);
                    self.spawn_job(async move {
                        let _ = backend.multipart_abort(&upload_key, &upload_id).await;
                    });
                }
                remote.exists.then_some(remote.key)
            }
            // Symlinks are plain objects.
            None => Some(self.key_of(&child)?),
        };
        if let Some(key) = key {
            let backend = Arc::clone(&self.backend);
            self.spawn_job(async move {
                if let Err(err) = backend.delete_blobs(&[key.clone()]).await {
                    warn!(key = %key, %err, "backend delete failed");
                }
            });
        }
        self.try_reclaim(&child);
        Ok(())
    }

    /// Removes an empty directory; marker and stray keys under the prefix
    /// are deleted asynchronously.
    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        let result = self.rmdir_inner(parent, name).await;
        self.record_op("rmdir", result.is_ok());
        result
    }

    async fn rmdir_inner(&self, parent: InodeId, name: &str) -> Result<(), FsError> {
        let dir = self.table.resolve(parent)?;
        let dir_state = self.require_dir(&dir)?;

        let child = match self.child_of(&dir, name) {
            Some(child) if child.state() != NodeState::Deleted => child,
            _ => {
                if self.listing_fresh(&dir) {
                    return Err(FsError::NotFound(name.to_string()));
                }
                self.probe_remote(&dir, name).await?
            }
        };
        if !child.is_dir() {
            return Err(FsError::NotADirectory(name.to_string()));
        }

        // The emptiness check needs a current view of the prefix.
        self.ensure_listed(&child).await?;
        {
            let children = child.dir_state().expect("directory").children.read().unwrap();
            let live = children
                .values()
                .filter_map(|id| self.table.get(*id))
                .any(|c| c.state() != NodeState::Deleted);
            if live {
                return Err(FsError::NotEmpty(name.to_string()));
            }
        }

        {
            let mut children = dir_state.children.write().unwrap();
            if children.get(name) == Some(&child.id) {
                children.remove(name);
            }
        }
        child.set_state(NodeState::Deleted);
        self.mark_listing_stale(&dir);

        // Delete the marker plus anything still lingering under the prefix
        // (markers of removed subdirectories, remnants of crashed writers).
        let prefix = self.key_of(&child)?.dir_prefix();
        let marker = self.key_of(&child)?.marker();
        let backend = Arc::clone(&self.backend);
        let page_size = self.config.listing.page_size;
        let batch = self.caps.max_delete_batch.max(1);
        self.spawn_job(async move {
            if let Err(err) =
                delete_prefix(backend.as_ref(), &prefix, Some(marker), page_size, batch).await
            {
                warn!(prefix, %err, "recursive directory delete failed");
            }
        });
        self.try_reclaim(&child);
        Ok(())
    }

    /// Creates a symlink, persisted as an empty object whose metadata
    /// carries the target.
    pub async fn symlink(
        &self,
        parent: InodeId,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut, FsError> {
        let result = self.symlink_inner(parent, name, target, uid, gid).await;
        self.record_op("symlink", result.is_ok());
        result
    }

    async fn symlink_inner(
        &self,
        parent: InodeId,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut, FsError> {
        Self::validate_name(name)?;
        let dir = self.table.resolve(parent)?;
        let dir_state = self.require_dir(&dir)?;

        if let Some(existing) = self.child_of(&dir, name) {
            if existing.state() != NodeState::Deleted {
                return Err(FsError::Exists(name.to_string()));
            }
        }

        let mut attr = InodeAttr::symlink(uid, gid);
        attr.size = target.len() as u64;
        let inode = self.table.insert(
            name.to_string(),
            dir.id,
            attr.clone(),
            NodeState::NewFile,
            None,
        );
        {
            let mut meta = inode.meta.write().unwrap();
            meta.symlink_target = Some(target.to_string());
        }
        {
            let mut children = dir_state.children.write().unwrap();
            if children.contains_key(name) {
                self.table.remove(inode.id);
                return Err(FsError::Exists(name.to_string()));
            }
            children.insert(name.to_string(), inode.id);
        }
        self.mark_listing_stale(&dir);

        let key = self.key_of(&inode)?;
        let metadata = encode_attr(&attr, &BTreeMap::new(), Some(target));
        let backend = Arc::clone(&self.backend);
        let node = Arc::clone(&inode);
        self.spawn_job(async move {
            match backend
                .put_blob(PutBlobRequest {
                    key: key.clone(),
                    data: Vec::new(),
                    metadata,
                    content_type: None,
                })
                .await
            {
                Ok(output) => {
                    let mut meta = node.meta.write().unwrap();
                    meta.etag = Some(output.etag);
                    if meta.state == NodeState::NewFile {
                        meta.state = NodeState::Clean;
                    }
                }
                Err(err) => warn!(%err, "symlink object write failed"),
            }
        });

        inode.pin_lookup();
        Ok(Self::entry_out(&inode))
    }

    pub fn readlink(&self, ino: InodeId) -> Result<String, FsError> {
        let inode = self.table.resolve(ino)?;
        let meta = inode.meta.read().unwrap();
        meta.symlink_target
            .clone()
            .ok_or_else(|| FsError::Invalid(format!("inode {ino} is not a symlink")))
    }

    // ========================================================================
    // Extended attributes
    // ========================================================================

    pub fn getxattr(&self, ino: InodeId, name: &str) -> Result<String, FsError> {
        let inode = self.table.resolve(ino)?;
        let meta = inode.meta.read().unwrap();
        meta.xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NotFound(format!("xattr {name}")))
    }

    pub fn listxattr(&self, ino: InodeId) -> Result<Vec<String>, FsError> {
        let inode = self.table.resolve(ino)?;
        let meta = inode.meta.read().unwrap();
        Ok(meta.xattrs.keys().cloned().collect())
    }

    pub fn setxattr(&self, ino: InodeId, name: &str, value: &str) -> Result<(), FsError> {
        let inode = self.table.resolve(ino)?;
        {
            let mut meta = inode.meta.write().unwrap();
            meta.xattrs.insert(name.to_string(), value.to_string());
            if meta.state == NodeState::Clean {
                meta.state = NodeState::Modified;
            }
        }
        self.push_metadata(&inode);
        Ok(())
    }

    pub fn removexattr(&self, ino: InodeId, name: &str) -> Result<(), FsError> {
        let inode = self.table.resolve(ino)?;
        {
            let mut meta = inode.meta.write().unwrap();
            if meta.xattrs.remove(name).is_none() {
                return Err(FsError::NotFound(format!("xattr {name}")));
            }
            if meta.state == NodeState::Clean {
                meta.state = NodeState::Modified;
            }
        }
        self.push_metadata(&inode);
        Ok(())
    }

    /// Re-encodes the inode's metadata into its file slot for the next
    /// flush. No-op for directories (their attributes live in memory and
    /// on the marker written at creation).
    fn push_metadata(&self, inode: &Arc<Inode>) {
        if let Some(slot) = &inode.file {
            let (attr, xattrs, target) = {
                let meta = inode.meta.read().unwrap();
                (
                    meta.attr.clone(),
                    meta.xattrs.clone(),
                    meta.symlink_target.clone(),
                )
            };
            slot.set_metadata(encode_attr(&attr, &xattrs, target.as_deref()));
            self.flusher.note_dirty(slot);
        }
    }

    // ========================================================================
    // statfs / unmount
    // ========================================================================

    pub fn statfs(&self) -> FsStats {
        let pool = self.pool.stats();
        FsStats {
            budget_bytes: pool.budget,
            cached_bytes: pool.cached,
            dirty_bytes: pool.dirty,
            inodes: self.table.len() as u64,
        }
    }

    /// Orderly unmount: stop prefetching, flush every dirty file within
    /// the deadline, drain background jobs, clean the spill directory.
    /// Refused when dirty data cannot be flushed, unless forced.
    pub async fn unmount(&self, force: bool) -> Result<(), FsError> {
        self.cancel.cancel();

        let flush_all = async {
            let mut failures = 0u32;
            for inode in self.table.all() {
                if inode.state() == NodeState::Deleted {
                    continue;
                }
                let Some(slot) = &inode.file else { continue };
                if !slot.needs_flush() && slot.sticky().is_none() {
                    continue;
                }
                match self.flusher.sync(slot).await {
                    Ok(outcome) => self.apply_flush_outcome(&inode, &outcome),
                    Err(err) => {
                        warn!(ino = %inode.id, %err, "unmount flush failed");
                        failures += 1;
                    }
                }
            }
            failures
        };

        let failures = match tokio::time::timeout(UNMOUNT_DEADLINE, flush_all).await {
            Ok(failures) => failures,
            Err(_) => {
                warn!("unmount flush sweep hit the deadline");
                u32::MAX
            }
        };

        if failures > 0 && !force {
            return Err(FsError::Busy(
                "dirty data could not be flushed; unmount refused (use force to discard)"
                    .to_string(),
            ));
        }
        if failures > 0 {
            warn!(failures, "forced unmount discarding dirty data");
        }

        self.drain_background().await;
        if let Some(spill) = &self.spill {
            spill.cleanup();
        }
        info!("driftfs unmounted");
        Ok(())
    }

    pub(crate) fn apply_flush_outcome(
        &self,
        inode: &Arc<Inode>,
        outcome: &driftfs_flush::FlushOutcome,
    ) {
        let mut meta = inode.meta.write().unwrap();
        if let Some(etag) = &outcome.etag {
            meta.etag = Some(etag.clone());
        }
        if let Some(mtime) = outcome.mtime {
            meta.attr.mtime = SystemTime::from(mtime);
        }
        if matches!(meta.state, NodeState::Modified | NodeState::NewFile) {
            meta.state = NodeState::Clean;
        }
    }
}

/// Lists a prefix to exhaustion and deletes everything under it, marker
/// included, honouring the backend's batch limit. Nothing is deleted
/// before the listing of that page succeeded.
pub(crate) async fn delete_prefix(
    backend: &dyn ObjectBackend,
    prefix: &str,
    marker: Option<ObjectKey>,
    page_size: usize,
    batch: usize,
) -> Result<(), FsError> {
    let mut continuation: Option<String> = None;
    let mut keys: Vec<ObjectKey> = marker.into_iter().collect();
    loop {
        let page = backend
            .list_blobs(&driftfs_core::ports::ListBlobsRequest {
                prefix: prefix.to_string(),
                delimiter: None,
                continuation: continuation.clone(),
                max_keys: page_size,
            })
            .await
            .map_err(FsError::from)?;
        keys.extend(page.items.into_iter().map(|item| item.key));
        match page.next_continuation {
            Some(token) => continuation = Some(token),
            None => break,
        }
    }
    keys.sort();
    keys.dedup();
    for chunk in keys.chunks(batch) {
        backend.delete_blobs(chunk).await.map_err(FsError::from)?;
    }
    Ok(())
}
