//! Filesystem error taxonomy.
//!
//! Every fallible operation in the core returns `FsError`. The set of
//! variants is exactly what the kernel surface needs: an adapter maps each
//! variant to one errno value (see `driftfs-fs::error`). Errors are `Clone`
//! because a failed flush sticks to the inode and is re-surfaced by later
//! operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by filesystem operations.
///
/// Serializable so a cluster peer can return them over the internal RPC.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FsError {
    /// Requested inode or object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Auth failure or forbidden operation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Temporary condition, the caller may retry.
    #[error("resource busy: {0}")]
    Busy(String),

    /// The backend lacks the required capability.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Create clashed with an existing name.
    #[error("already exists: {0}")]
    Exists(String),

    /// Exceeds a backend limit that cannot be worked around.
    #[error("too large: {0}")]
    TooLarge(String),

    /// Network or transport failure after retries were exhausted.
    #[error("I/O error: {0}")]
    Io(String),

    /// Malformed input or constraint violation.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// Directory has children.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Path component is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Operation requires a regular file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Name or key exceeds the allowed length.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Cached state was invalidated (cluster member loss, remount needed).
    #[error("stale handle: {0}")]
    Stale(String),
}

impl FsError {
    /// True for errors a caller may reasonably retry without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::Busy(_))
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => FsError::Permission(err.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::Exists(err.to_string()),
            _ => FsError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FsError::NotFound("photos/beach.jpg".to_string());
        assert_eq!(err.to_string(), "not found: photos/beach.jpg");

        let err = FsError::NotEmpty("docs".to_string());
        assert_eq!(err.to_string(), "directory not empty: docs");
    }

    #[test]
    fn test_error_equality_and_clone() {
        let err = FsError::Busy("flush in progress".to_string());
        assert_eq!(err, err.clone());
        assert!(err.is_retryable());
        assert!(!FsError::Io("socket closed".to_string()).is_retryable());
    }

    #[test]
    fn test_from_io_error() {
        let err: FsError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(matches!(err, FsError::NotFound(_)));

        let err: FsError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(matches!(err, FsError::Io(_)));
    }
}
