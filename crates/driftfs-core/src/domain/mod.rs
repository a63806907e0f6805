//! Domain types shared across the filesystem core.

pub mod attr;
pub mod errors;
pub mod newtypes;

pub use attr::{InodeAttr, InodeKind, SetAttr};
pub use errors::FsError;
pub use newtypes::{Etag, InodeId, ObjectKey, UploadId};
