//! Directory listing cache.
//!
//! A directory's child map fills from two sources: single lookups (head
//! probes) and prefix listings. Listings page until exhausted and merge
//! into the map without ever clobbering locally modified entries; clean
//! entries that vanished remotely are dropped. A completed listing stays
//! authoritative for the configured TTL and is invalidated by any local
//! mutation under the prefix.
//!
//! When a name exists both as an object and as a prefix (`foo` and
//! `foo/...`), the directory wins and the shadowed file is hidden with a
//! warning; surfacing both under one name is not representable in POSIX.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use driftfs_core::domain::{FsError, InodeAttr};
use driftfs_core::ports::{ListBlobsOutput, ListBlobsRequest};
use tracing::{debug, warn};

use crate::fs::{DirEntry, DriftFs};
use crate::node::{Inode, ListingState, NodeState};

impl DriftFs {
    /// True while the directory's completed listing is inside its TTL.
    pub(crate) fn listing_fresh(&self, dir: &Inode) -> bool {
        let Some(dir_state) = dir.dir_state() else {
            return false;
        };
        let ttl = Duration::from_secs(self.config.listing.ttl_secs);
        match &*dir_state.listing.lock().unwrap() {
            ListingState::Complete { fetched_at } => fetched_at.elapsed() < ttl,
            _ => false,
        }
    }

    /// Invalidates the cached listing after a mutation under the prefix.
    pub(crate) fn mark_listing_stale(&self, dir: &Inode) {
        if let Some(dir_state) = dir.dir_state() {
            *dir_state.listing.lock().unwrap() = ListingState::Unlisted;
        }
    }

    /// Brings the directory's child map up to date with the backend,
    /// paging the listing to exhaustion.
    pub(crate) async fn ensure_listed(&self, dir: &Arc<Inode>) -> Result<(), FsError> {
        let dir_state = self.require_dir(dir)?;
        if self.listing_fresh(dir) {
            return Ok(());
        }

        let prefix = self.key_of(dir)?.dir_prefix();
        let mut continuation: Option<String> = None;
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut seen_dirs: BTreeSet<String> = BTreeSet::new();

        loop {
            let page = self
                .backend
                .list_blobs(&ListBlobsRequest {
                    prefix: prefix.clone(),
                    delimiter: Some('/'),
                    continuation: continuation.clone(),
                    max_keys: self.config.listing.page_size,
                })
                .await
                .map_err(FsError::from)?;

            self.merge_page(dir, &prefix, &page, &mut seen, &mut seen_dirs)?;

            match page.next_continuation {
                Some(token) => {
                    *dir_state.listing.lock().unwrap() = ListingState::Partial {
                        continuation: token.clone(),
                        fetched_at: Instant::now(),
                    };
                    continuation = Some(token);
                }
                None => break,
            }
        }

        // While a rename of this directory (or an ancestor) is still being
        // executed against the backend, the old keys have not landed under
        // the new prefix yet; the in-memory entries are the truth.
        if !self.under_pending_rename(dir) {
            self.prune_vanished(dir, &seen);
        }
        *dir_state.listing.lock().unwrap() = ListingState::Complete {
            fetched_at: Instant::now(),
        };
        debug!(prefix, entries = seen.len(), "directory listing refreshed");
        Ok(())
    }

    /// Merges one listing page into the child map. Locally dirty children
    /// always win over what the listing claims.
    fn merge_page(
        &self,
        dir: &Arc<Inode>,
        prefix: &str,
        page: &ListBlobsOutput,
        seen: &mut BTreeSet<String>,
        seen_dirs: &mut BTreeSet<String>,
    ) -> Result<(), FsError> {
        for common in &page.common_prefixes {
            let name = common
                .strip_prefix(prefix)
                .unwrap_or(common)
                .trim_end_matches('/')
                .to_string();
            if name.is_empty() {
                continue;
            }
            seen.insert(name.clone());
            seen_dirs.insert(name.clone());
            if self.child_of(dir, &name).is_none() {
                self.materialize_child(
                    dir,
                    &name,
                    InodeAttr::directory(0o755, 0, 0),
                    None,
                    None,
                    None,
                    None,
                )?;
            }
        }

        for item in &page.items {
            // The directory's own marker lists under its prefix.
            if item.key.as_str() == prefix {
                continue;
            }
            let name = item.key.name().to_string();
            if name.is_empty() {
                continue;
            }

            if item.key.is_marker() {
                seen.insert(name.clone());
                seen_dirs.insert(name.clone());
                if self.child_of(dir, &name).is_none() {
                    self.materialize_child(
                        dir,
                        &name,
                        InodeAttr::directory(0o755, 0, 0),
                        Some(item.etag.clone()),
                        item.storage_class.clone(),
                        None,
                        None,
                    )?;
                }
                continue;
            }

            if seen_dirs.contains(&name) {
                warn!(
                    key = %item.key,
                    "object shadowed by directory of the same name, hiding file"
                );
                continue;
            }
            seen.insert(name.clone());

            match self.child_of(dir, &name) {
                Some(existing) => {
                    if existing.is_dir() {
                        warn!(
                            key = %item.key,
                            "object shadowed by directory of the same name, hiding file"
                        );
                        continue;
                    }
                    // Refresh only untouched entries; local changes win.
                    if existing.state() == NodeState::Clean && existing.open_count() == 0 {
                        let mut meta = existing.meta.write().unwrap();
                        meta.attr.size = item.size;
                        meta.attr.mtime = SystemTime::from(item.mtime);
                        meta.etag = Some(item.etag.clone());
                        meta.storage_class = item.storage_class.clone();
                    }
                }
                None => {
                    let mut attr = InodeAttr::file(0o644, 0, 0);
                    attr.size = item.size;
                    attr.mtime = SystemTime::from(item.mtime);
                    self.materialize_child(
                        dir,
                        &name,
                        attr,
                        Some(item.etag.clone()),
                        item.storage_class.clone(),
                        None,
                        Some((item.etag.clone(), Default::default(), item.size)),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// True when this directory or any ancestor still has its backend
    /// move in flight.
    fn under_pending_rename(&self, dir: &Arc<Inode>) -> bool {
        let mut cursor = Arc::clone(dir);
        for _ in 0..256 {
            if cursor.state() == NodeState::Renamed {
                return true;
            }
            if cursor.id.is_root() {
                return false;
            }
            match self.table.get(cursor.parent_id()) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
        false
    }

    /// Drops clean children the completed listing no longer contains.
    fn prune_vanished(&self, dir: &Arc<Inode>, seen: &BTreeSet<String>) {
        let Some(dir_state) = dir.dir_state() else {
            return;
        };
        let stale: Vec<(String, Arc<Inode>)> = {
            let children = dir_state.children.read().unwrap();
            children
                .iter()
                .filter(|(name, _)| !seen.contains(*name))
                .filter_map(|(name, id)| {
                    self.table.get(*id).map(|inode| (name.clone(), inode))
                })
                .filter(|(_, inode)| {
                    inode.state() == NodeState::Clean && inode.open_count() == 0
                })
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut children = dir_state.children.write().unwrap();
        for (name, inode) in stale {
            debug!(name, ino = %inode.id, "remote entry vanished, dropping");
            if children.get(&name) == Some(&inode.id) {
                children.remove(&name);
            }
            if inode.reclaimable() {
                self.table.remove(inode.id);
            }
        }
    }

    /// Invalidates cached state around a path another writer changed: the
    /// parent directory's listing goes stale, so the next operation
    /// re-observes the backend. Cluster peers call this on invalidation
    /// broadcasts.
    pub fn invalidate_path(&self, path: &str) {
        let mut dir = self.table.root();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.is_empty() {
            self.mark_listing_stale(&dir);
            return;
        }
        for segment in &segments[..segments.len() - 1] {
            match self.child_of(&dir, segment) {
                Some(child) if child.is_dir() => dir = child,
                _ => return,
            }
        }
        self.mark_listing_stale(&dir);
    }

    /// Lists a directory. Entries come back sorted by name; `.` and `..`
    /// are the adapter's business.
    pub async fn readdir(&self, ino: driftfs_core::domain::InodeId) -> Result<Vec<DirEntry>, FsError> {
        let result = self.readdir_inner(ino).await;
        self.record_op("readdir", result.is_ok());
        result
    }

    async fn readdir_inner(
        &self,
        ino: driftfs_core::domain::InodeId,
    ) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.table.resolve(ino)?;
        self.require_dir(&dir)?;
        self.ensure_listed(&dir).await?;

        let dir_state = dir.dir_state().expect("directory");
        let children = dir_state.children.read().unwrap();
        let mut entries = Vec::with_capacity(children.len());
        for (name, id) in children.iter() {
            let Some(child) = self.table.get(*id) else {
                continue;
            };
            if child.state() == NodeState::Deleted {
                continue;
            }
            entries.push(DirEntry {
                name: name.clone(),
                ino: child.id,
                kind: child.kind(),
            });
        }
        Ok(entries)
    }
}
