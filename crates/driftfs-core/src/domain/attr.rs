//! Inode attributes and attribute change-sets.

use std::time::SystemTime;

/// What an inode represents. Hard links are unsupported, so the kind is
/// fixed for the lifetime of the inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
}

/// POSIX-visible attributes of an inode.
#[derive(Debug, Clone, PartialEq)]
pub struct InodeAttr {
    pub kind: InodeKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u32,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub atime: SystemTime,
}

impl InodeAttr {
    fn new(kind: InodeKind, mode: u32, uid: u32, gid: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind,
            mode,
            uid,
            gid,
            size: 0,
            nlink: if kind == InodeKind::Directory { 2 } else { 1 },
            mtime: now,
            ctime: now,
            atime: now,
        }
    }

    pub fn file(mode: u32, uid: u32, gid: u32) -> Self {
        Self::new(InodeKind::File, mode, uid, gid)
    }

    pub fn directory(mode: u32, uid: u32, gid: u32) -> Self {
        Self::new(InodeKind::Directory, mode, uid, gid)
    }

    pub fn symlink(uid: u32, gid: u32) -> Self {
        Self::new(InodeKind::Symlink, 0o777, uid, gid)
    }

    /// Bumps mtime and ctime to now after a content mutation.
    pub fn touch_modified(&mut self) {
        let now = SystemTime::now();
        self.mtime = now;
        self.ctime = now;
    }
}

/// A partial attribute update, as produced by a `setattr` kernel call.
/// `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
    pub atime: Option<SystemTime>,
}

impl SetAttr {
    /// True when no field is set.
    pub fn is_empty(&self) -> bool {
        *self == SetAttr::default()
    }

    /// True when the change-set only touches metadata, not content length.
    pub fn is_metadata_only(&self) -> bool {
        self.size.is_none() && !self.is_empty()
    }
}
