//! Validated newtypes for identifiers used throughout the core.
//!
//! Object stores address data by flat string keys; the kernel addresses it
//! by inode number. These wrappers keep the two namespaces from leaking
//! into each other and centralise key validation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::errors::FsError;

/// Maximum length of an object key in bytes (S3 limit).
const KEY_MAX: usize = 1024;

/// Maximum length of a single path component (POSIX NAME_MAX).
pub const NAME_MAX: usize = 255;

// ============================================================================
// InodeId
// ============================================================================

/// Dense 64-bit inode identifier. `InodeId::ROOT` is the mount root.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeId(u64);

impl InodeId {
    /// The mount root, always inode 1.
    pub const ROOT: InodeId = InodeId(1);

    /// Wraps a raw inode number.
    pub fn new(raw: u64) -> Self {
        InodeId(raw)
    }

    /// Returns the raw inode number.
    pub fn get(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the mount root.
    pub fn is_root(&self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// ObjectKey
// ============================================================================

/// A validated object-store key.
///
/// Keys are relative (`photos/2024/beach.jpg`), never start with `/`, and
/// contain no empty, `.` or `..` segments. A trailing `/` is allowed and
/// denotes a directory marker blob. The mount root maps to the empty key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// The key of the mount root (the empty prefix).
    pub fn root() -> Self {
        ObjectKey(String::new())
    }

    /// Validates and wraps a raw key string.
    pub fn new(raw: impl Into<String>) -> Result<Self, FsError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Ok(ObjectKey(raw));
        }
        if raw.len() > KEY_MAX {
            return Err(FsError::NameTooLong(format!(
                "key exceeds {} bytes",
                KEY_MAX
            )));
        }
        if raw.starts_with('/') {
            return Err(FsError::Invalid(format!("key must be relative: {raw}")));
        }
        let mut segments = raw.split('/').peekable();
        while let Some(segment) = segments.next() {
            let is_last = segments.peek().is_none();
            if segment.is_empty() {
                // Only a single trailing slash is tolerated (marker keys).
                if is_last {
                    continue;
                }
                return Err(FsError::Invalid(format!("empty key segment in: {raw}")));
            }
            if segment == "." || segment == ".." {
                return Err(FsError::Invalid(format!("relative segment in: {raw}")));
            }
            if segment.len() > NAME_MAX {
                return Err(FsError::NameTooLong(segment.to_string()));
            }
        }
        Ok(ObjectKey(raw))
    }

    /// Returns the raw key string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for the mount-root key.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if this key names a directory marker (trailing `/`).
    pub fn is_marker(&self) -> bool {
        self.0.ends_with('/')
    }

    /// The listing prefix for children of this key: `""` for the root,
    /// `key/` otherwise.
    pub fn dir_prefix(&self) -> String {
        if self.0.is_empty() {
            String::new()
        } else if self.0.ends_with('/') {
            self.0.clone()
        } else {
            format!("{}/", self.0)
        }
    }

    /// The directory marker key for this directory (`key/`).
    pub fn marker(&self) -> ObjectKey {
        ObjectKey(self.dir_prefix())
    }

    /// Builds the key of a child named `name` under this directory.
    pub fn child(&self, name: &str) -> Result<ObjectKey, FsError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(FsError::Invalid(format!("invalid name: {name}")));
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong(name.to_string()));
        }
        ObjectKey::new(format!("{}{}", self.dir_prefix(), name))
    }

    /// The final path component, without any trailing slash.
    pub fn name(&self) -> &str {
        self.0.trim_end_matches('/').rsplit('/').next().unwrap_or("")
    }

    /// The key with any trailing marker slash removed.
    pub fn without_marker(&self) -> ObjectKey {
        ObjectKey(self.0.trim_end_matches('/').to_string())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Etag
// ============================================================================

/// Backend object version identifier as observed at last head/put/list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Etag(String);

impl Etag {
    pub fn new(raw: impl Into<String>) -> Self {
        Etag(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Etag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// UploadId
// ============================================================================

/// Backend-issued identifier of an in-flight multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(String);

impl UploadId {
    pub fn new(raw: impl Into<String>) -> Self {
        UploadId(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
