//! Mapping of filesystem errors onto libc errno values.
//!
//! The FUSE adapter replies with these numbers directly.

use driftfs_core::domain::FsError;

/// The errno a kernel reply should carry for this error.
pub fn errno(err: &FsError) -> libc::c_int {
    match err {
        FsError::NotFound(_) => libc::ENOENT,
        FsError::Permission(_) => libc::EACCES,
        FsError::Busy(_) => libc::EAGAIN,
        FsError::NotSupported(_) => libc::ENOTSUP,
        FsError::Exists(_) => libc::EEXIST,
        FsError::TooLarge(_) => libc::EFBIG,
        FsError::Io(_) => libc::EIO,
        FsError::Invalid(_) => libc::EINVAL,
        FsError::NotEmpty(_) => libc::ENOTEMPTY,
        FsError::NotADirectory(_) => libc::ENOTDIR,
        FsError::IsADirectory(_) => libc::EISDIR,
        FsError::NameTooLong(_) => libc::ENAMETOOLONG,
        FsError::Stale(_) => libc::ESTALE,
    }
}
