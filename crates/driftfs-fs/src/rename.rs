//! Rename over a flat key space.
//!
//! The graph is updated first, atomically under both directory locks, so
//! the kernel sees the new name immediately. The backend move runs as a
//! background job in tiers: a server-side rename when the driver has one,
//! otherwise copy-everything-then-delete with a strict ordering guarantee:
//! no key is deleted before every copy confirmed. A failed job rolls the
//! graph back to the source name; duplicates may remain at the old prefix
//! after a crash, but nothing is ever lost.
//!
//! Copies racing on one destination key (two renames targeting the same
//! name) are serialised through a per-key mutex.

use std::sync::Arc;

use driftfs_core::domain::{FsError, InodeId, ObjectKey};
use driftfs_core::ports::ListBlobsRequest;
use tracing::{debug, info, warn};

use crate::fs::DriftFs;
use crate::node::{Inode, NodeState};

type ChildMapGuard<'a> = std::sync::RwLockWriteGuard<'a, std::collections::BTreeMap<String, InodeId>>;

/// Write access to the child maps of a rename's two directories, which
/// may be the same directory.
enum DirPair<'a> {
    Same(ChildMapGuard<'a>),
    Distinct(ChildMapGuard<'a>, ChildMapGuard<'a>),
}

impl DirPair<'_> {
    fn src(&mut self) -> &mut std::collections::BTreeMap<String, InodeId> {
        match self {
            DirPair::Same(guard) => guard,
            DirPair::Distinct(src, _) => src,
        }
    }

    fn dst(&mut self) -> &mut std::collections::BTreeMap<String, InodeId> {
        match self {
            DirPair::Same(guard) => guard,
            DirPair::Distinct(_, dst) => dst,
        }
    }
}

/// Everything the background job and its rollback need.
struct RenameJob {
    moved: Arc<Inode>,
    src_parent: Arc<Inode>,
    dst_parent: Arc<Inode>,
    src_name: String,
    dst_name: String,
    src_key: ObjectKey,
    dst_key: ObjectKey,
    is_dir: bool,
    /// The source object exists remotely (files only; directories list).
    had_remote: bool,
    /// Overwritten destination inode, already unlinked from the graph.
    displaced: Option<Arc<Inode>>,
    /// True when the displaced entry had a backend object.
    displaced_had_remote: bool,
    /// Marker blob of a displaced empty directory, deleted after the move.
    displaced_marker: Option<ObjectKey>,
}

impl DriftFs {
    /// Moves `src_parent/src_name` to `dst_parent/dst_name`.
    pub async fn rename(
        self: &Arc<Self>,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<(), FsError> {
        let result = self
            .rename_inner(src_parent, src_name, dst_parent, dst_name)
            .await;
        self.record_op("rename", result.is_ok());
        result
    }

    async fn rename_inner(
        self: &Arc<Self>,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<(), FsError> {
        if dst_name.is_empty() || dst_name.contains('/') {
            return Err(FsError::Invalid(format!("invalid name: {dst_name}")));
        }
        let src_dir = self.table.resolve(src_parent)?;
        let dst_dir = self.table.resolve(dst_parent)?;
        self.require_dir(&src_dir)?;
        self.require_dir(&dst_dir)?;

        // Both ends need a current view: the source must exist, and an
        // unmaterialised destination object must be discovered before we
        // decide whether this rename overwrites.
        self.ensure_listed(&src_dir).await?;
        self.ensure_listed(&dst_dir).await?;

        let moved = match self.child_of(&src_dir, src_name) {
            Some(child) if child.state() != NodeState::Deleted => child,
            _ => return Err(FsError::NotFound(src_name.to_string())),
        };

        // For a directory, materialise the whole subtree before the move:
        // once the graph points at the new name, the old prefix is no
        // longer listed, and readdir under the new name must come from the
        // in-memory tree until the backend copy lands.
        if moved.is_dir() {
            self.ensure_subtree_listed(&moved).await?;
        }

        // A directory cannot move into its own subtree.
        if moved.is_dir() {
            let mut cursor = Arc::clone(&dst_dir);
            loop {
                if cursor.id == moved.id {
                    return Err(FsError::Invalid(
                        "cannot move a directory into itself".to_string(),
                    ));
                }
                if cursor.id.is_root() {
                    break;
                }
                cursor = self.table.resolve(cursor.parent_id())?;
            }
        }

        let displaced = self
            .child_of(&dst_dir, dst_name)
            .filter(|c| c.state() != NodeState::Deleted && c.id != moved.id);
        let mut displaced_marker = None;
        let mut displaced_had_remote = false;
        if let Some(existing) = &displaced {
            match (moved.is_dir(), existing.is_dir()) {
                (true, false) => return Err(FsError::NotADirectory(dst_name.to_string())),
                (false, true) => return Err(FsError::IsADirectory(dst_name.to_string())),
                (_, true) => {
                    self.ensure_listed(existing).await?;
                    let has_live = {
                        let children =
                            existing.dir_state().expect("directory").children.read().unwrap();
                        children
                            .values()
                            .filter_map(|id| self.table.get(*id))
                            .any(|c| c.state() != NodeState::Deleted)
                    };
                    if has_live {
                        return Err(FsError::NotEmpty(dst_name.to_string()));
                    }
                    displaced_marker = Some(self.key_of(existing)?.marker());
                    displaced_had_remote = existing.meta.read().unwrap().etag.is_some();
                }
                (_, false) => {
                    displaced_had_remote = existing
                        .file
                        .as_ref()
                        .map(|slot| slot.remote().exists)
                        .unwrap_or_else(|| existing.meta.read().unwrap().etag.is_some());
                }
            }
        }

        let src_key = self.key_of(&src_dir)?.child(src_name)?;
        let dst_key = self.key_of(&dst_dir)?.child(dst_name)?;
        let had_remote = match &moved.file {
            Some(slot) => slot.remote().exists,
            None => moved.meta.read().unwrap().etag.is_some(),
        };

        let is_dir = moved.is_dir();

        // Apply the move to the graph first; the kernel sees it at once.
        self.with_dir_pair(&src_dir, &dst_dir, |pair| {
            if pair.src().get(src_name) != Some(&moved.id) {
                return Err(FsError::Busy(format!("{src_name} changed while renaming")));
            }
            pair.src().remove(src_name);
            pair.dst().insert(dst_name.to_string(), moved.id);
            Ok(())
        })?;
        if let Some(existing) = &displaced {
            existing.set_state(NodeState::Deleted);
        }
        {
            let mut meta = moved.meta.write().unwrap();
            meta.name = dst_name.to_string();
            meta.parent = dst_dir.id;
            if meta.state != NodeState::NewFile {
                meta.state = NodeState::Renamed;
            }
        }
        self.retarget_keys(&moved)?;
        self.mark_listing_stale(&src_dir);
        self.mark_listing_stale(&dst_dir);
        info!(src = %src_key, dst = %dst_key, "rename applied to graph");

        let job = RenameJob {
            moved,
            src_parent: src_dir,
            dst_parent: dst_dir,
            src_name: src_name.to_string(),
            dst_name: dst_name.to_string(),
            src_key,
            dst_key,
            is_dir,
            had_remote,
            displaced,
            displaced_had_remote,
            displaced_marker,
        };

        let fs = Arc::clone(self);
        self.spawn_job(async move {
            run_rename_job(fs, job).await;
        });
        Ok(())
    }

    /// Runs `f` with both child maps write-locked, taken in id order so
    /// two concurrent renames cannot deadlock. A same-directory rename
    /// locks the single map once.
    fn with_dir_pair<R>(
        &self,
        src: &Arc<Inode>,
        dst: &Arc<Inode>,
        f: impl FnOnce(&mut DirPair<'_>) -> R,
    ) -> R {
        let src_state = src.dir_state().expect("directory");
        let dst_state = dst.dir_state().expect("directory");
        if src.id == dst.id {
            let guard = src_state.children.write().unwrap();
            f(&mut DirPair::Same(guard))
        } else if src.id < dst.id {
            let src_guard = src_state.children.write().unwrap();
            let dst_guard = dst_state.children.write().unwrap();
            f(&mut DirPair::Distinct(src_guard, dst_guard))
        } else {
            let dst_guard = dst_state.children.write().unwrap();
            let src_guard = src_state.children.write().unwrap();
            f(&mut DirPair::Distinct(src_guard, dst_guard))
        }
    }

    /// Lists a directory and every subdirectory below it.
    async fn ensure_subtree_listed(&self, dir: &Arc<Inode>) -> Result<(), FsError> {
        let mut queue = vec![Arc::clone(dir)];
        while let Some(node) = queue.pop() {
            self.ensure_listed(&node).await?;
            let dir_state = node.dir_state().expect("queued nodes are directories");
            let child_ids: Vec<InodeId> =
                dir_state.children.read().unwrap().values().copied().collect();
            for id in child_ids {
                if let Some(child) = self.table.get(id) {
                    if child.is_dir() {
                        queue.push(child);
                    }
                }
            }
        }
        Ok(())
    }

    /// Repoints every file slot in the moved subtree at its new key.
    fn retarget_keys(&self, inode: &Arc<Inode>) -> Result<(), FsError> {
        let mut stack = vec![Arc::clone(inode)];
        while let Some(node) = stack.pop() {
            if let Some(slot) = &node.file {
                slot.set_key(self.key_of(&node)?);
            }
            if let Some(dir_state) = node.dir_state() {
                let ids: Vec<InodeId> =
                    dir_state.children.read().unwrap().values().copied().collect();
                for id in ids {
                    if let Some(child) = self.table.get(id) {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(())
    }
}

async fn run_rename_job(fs: Arc<DriftFs>, job: RenameJob) {
    match execute_backend_rename(&fs, &job).await {
        Ok(()) => {
            if job.moved.state() == NodeState::Renamed {
                job.moved.set_state(NodeState::Clean);
            }
            debug!(src = %job.src_key, dst = %job.dst_key, "backend rename complete");
        }
        Err(err) => {
            warn!(src = %job.src_key, dst = %job.dst_key, %err, "backend rename failed, rolling back");
            rollback_rename(&fs, &job, err);
        }
    }
}

/// The tiers: server-side rename where advertised, copy-then-delete
/// otherwise. No delete is issued before every copy confirmed.
async fn execute_backend_rename(fs: &Arc<DriftFs>, job: &RenameJob) -> Result<(), FsError> {
    let backend = &fs.backend;

    // Collect (old, new) key pairs that exist remotely.
    let pairs: Vec<(ObjectKey, ObjectKey)> = if job.is_dir {
        let src_prefix = job.src_key.dir_prefix();
        let dst_prefix = job.dst_key.dir_prefix();
        let mut pairs = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = backend
                .list_blobs(&ListBlobsRequest {
                    prefix: src_prefix.clone(),
                    delimiter: None,
                    continuation: continuation.clone(),
                    max_keys: fs.config.listing.page_size,
                })
                .await
                .map_err(FsError::from)?;
            for item in page.items {
                let suffix = item
                    .key
                    .as_str()
                    .strip_prefix(&src_prefix)
                    .unwrap_or(item.key.as_str())
                    .to_string();
                let new_key = ObjectKey::new(format!("{dst_prefix}{suffix}"))?;
                pairs.push((item.key, new_key));
            }
            match page.next_continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }
        pairs
    } else if job.had_remote {
        vec![(job.src_key.clone(), job.dst_key.clone())]
    } else {
        Vec::new()
    };

    if fs.config.rename.overwrite_predelete && job.displaced_had_remote && !job.is_dir {
        backend
            .delete_blobs(&[job.dst_key.clone()])
            .await
            .map_err(FsError::from)?;
    }

    if fs.caps.supports_rename {
        for (old, new) in &pairs {
            backend.rename_blob(old, new).await.map_err(FsError::from)?;
        }
    } else {
        // Copy phase. Every copy must land before anything is deleted.
        for (old, new) in &pairs {
            let lock = fs
                .copy_locks
                .entry(new.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = lock.lock().await;
            backend.copy_blob(old, new, None).await.map_err(FsError::from)?;
        }
        // Delete phase.
        let old_keys: Vec<ObjectKey> = pairs.iter().map(|(old, _)| old.clone()).collect();
        for chunk in old_keys.chunks(fs.caps.max_delete_batch.max(1)) {
            backend.delete_blobs(chunk).await.map_err(FsError::from)?;
        }
    }

    if let Some(marker) = &job.displaced_marker {
        if job.displaced_had_remote {
            let _ = backend.delete_blobs(std::slice::from_ref(marker)).await;
        }
    }
    Ok(())
}

/// Re-enters the source name into the graph after a failed backend move.
fn rollback_rename(fs: &Arc<DriftFs>, job: &RenameJob, err: FsError) {
    fs.with_dir_pair(&job.src_parent, &job.dst_parent, |pair| {
        if pair.dst().get(&job.dst_name) == Some(&job.moved.id) {
            pair.dst().remove(&job.dst_name);
        }
        pair.src().insert(job.src_name.clone(), job.moved.id);
        if let Some(displaced) = &job.displaced {
            pair.dst().entry(job.dst_name.clone()).or_insert(displaced.id);
        }
    });

    {
        let mut meta = job.moved.meta.write().unwrap();
        meta.name = job.src_name.clone();
        meta.parent = job.src_parent.id;
        if meta.state == NodeState::Renamed {
            meta.state = NodeState::Clean;
        }
    }
    if let Some(displaced) = &job.displaced {
        // Its object was never deleted; bring the entry back.
        displaced.set_state(NodeState::Clean);
    }
    let _ = fs.retarget_keys(&job.moved);
    fs.mark_listing_stale(&job.src_parent);
    fs.mark_listing_stale(&job.dst_parent);

    // The failure surfaces on the next flush of the moved file.
    if let Some(slot) = &job.moved.file {
        slot.set_sticky(err);
    }
}
