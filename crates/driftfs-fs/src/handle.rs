//! Open file handles.

use std::sync::Mutex;

use driftfs_core::domain::InodeId;
use driftfs_flush::ReadAhead;

/// One open file descriptor as the kernel sees it.
pub struct OpenHandle {
    pub ino: InodeId,
    /// Whether the handle was opened for writing.
    pub write: bool,
    /// Sequential-read detection state, per handle.
    pub read_ahead: Mutex<ReadAhead>,
}

impl OpenHandle {
    pub fn new(ino: InodeId, write: bool) -> Self {
        Self {
            ino,
            write,
            read_ahead: Mutex::new(ReadAhead::default()),
        }
    }
}
