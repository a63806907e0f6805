//! Inode attributes as backend object metadata.
//!
//! Mode, ownership, timestamps, symlink targets and user xattrs ride along
//! on the object under a vendor-neutral `dfs-` prefix. Stores differ in
//! how they case metadata keys, so decoding is case-insensitive.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use driftfs_core::domain::InodeAttr;
use driftfs_core::ports::Metadata;

/// Prefix of every metadata key written by this filesystem.
pub const META_PREFIX: &str = "dfs-";

const KEY_MODE: &str = "dfs-mode";
const KEY_UID: &str = "dfs-uid";
const KEY_GID: &str = "dfs-gid";
const KEY_MTIME: &str = "dfs-mtime-ns";
const KEY_SYMLINK: &str = "dfs-symlink";
/// User xattrs are stored as `dfs-x-<name>`.
const XATTR_PREFIX: &str = "dfs-x-";

/// Attribute fields recovered from object metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedMeta {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mtime: Option<SystemTime>,
    pub symlink_target: Option<String>,
    pub xattrs: BTreeMap<String, String>,
}

/// Renders attributes and xattrs into the metadata map attached to the
/// next upload of the object.
pub fn encode_attr(
    attr: &InodeAttr,
    xattrs: &BTreeMap<String, String>,
    symlink_target: Option<&str>,
) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(KEY_MODE.to_string(), format!("{:o}", attr.mode));
    metadata.insert(KEY_UID.to_string(), attr.uid.to_string());
    metadata.insert(KEY_GID.to_string(), attr.gid.to_string());
    if let Ok(since_epoch) = attr.mtime.duration_since(UNIX_EPOCH) {
        metadata.insert(KEY_MTIME.to_string(), since_epoch.as_nanos().to_string());
    }
    if let Some(target) = symlink_target {
        metadata.insert(KEY_SYMLINK.to_string(), target.to_string());
    }
    for (name, value) in xattrs {
        metadata.insert(format!("{XATTR_PREFIX}{name}"), value.clone());
    }
    metadata
}

/// Recovers attribute fields from object metadata, tolerating any key
/// casing the store hands back.
pub fn decode_attr(metadata: &Metadata) -> DecodedMeta {
    let mut decoded = DecodedMeta::default();
    for (raw_key, value) in metadata {
        let key = raw_key.to_ascii_lowercase();
        match key.as_str() {
            KEY_MODE => decoded.mode = u32::from_str_radix(value, 8).ok(),
            KEY_UID => decoded.uid = value.parse().ok(),
            KEY_GID => decoded.gid = value.parse().ok(),
            KEY_MTIME => {
                decoded.mtime = value
                    .parse::<u64>()
                    .ok()
                    .map(|nanos| UNIX_EPOCH + Duration::from_nanos(nanos));
            }
            KEY_SYMLINK => decoded.symlink_target = Some(value.clone()),
            _ => {
                if let Some(name) = key.strip_prefix(XATTR_PREFIX) {
                    decoded.xattrs.insert(name.to_string(), value.clone());
                }
            }
        }
    }
    decoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut attr = InodeAttr::file(0o640, 1000, 100);
        attr.mtime = UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789);
        let mut xattrs = BTreeMap::new();
        xattrs.insert("user.origin".to_string(), "camera".to_string());

        let metadata = encode_attr(&attr, &xattrs, None);
        assert_eq!(metadata.get(KEY_MODE).map(String::as_str), Some("640"));

        let decoded = decode_attr(&metadata);
        assert_eq!(decoded.mode, Some(0o640));
        assert_eq!(decoded.uid, Some(1000));
        assert_eq!(decoded.gid, Some(100));
        assert_eq!(decoded.mtime, Some(attr.mtime));
        assert_eq!(
            decoded.xattrs.get("user.origin").map(String::as_str),
            Some("camera")
        );
        assert!(decoded.symlink_target.is_none());
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let mut metadata = Metadata::new();
        metadata.insert("DFS-Mode".to_string(), "755".to_string());
        metadata.insert("DFS-SYMLINK".to_string(), "../target".to_string());

        let decoded = decode_attr(&metadata);
        assert_eq!(decoded.mode, Some(0o755));
        assert_eq!(decoded.symlink_target.as_deref(), Some("../target"));
    }

    #[test]
    fn test_unrelated_metadata_is_ignored() {
        let mut metadata = Metadata::new();
        metadata.insert("content-encoding".to_string(), "gzip".to_string());
        metadata.insert("dfs-mode".to_string(), "not-octal".to_string());

        let decoded = decode_attr(&metadata);
        assert!(decoded.mode.is_none());
        assert!(decoded.xattrs.is_empty());
    }
}
