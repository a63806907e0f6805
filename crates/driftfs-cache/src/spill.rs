//! On-disk spill files for dirty buffers squeezed out under memory
//! pressure.
//!
//! Files are named `spill-<inode>-<generation>` under the configured spill
//! directory, removed once their buffer flushes, cleaned on orderly
//! unmount, and scanned (best effort) on startup to report leftovers from
//! a crashed process.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Manages spilled buffer data on local disk.
pub struct SpillStore {
    dir: PathBuf,
}

impl SpillStore {
    /// Creates the spill directory if needed.
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, ino: u64, generation: u64) -> PathBuf {
        self.dir.join(format!("spill-{ino}-{generation}"))
    }

    /// Writes buffer bytes to a spill file and returns its path.
    pub fn write(&self, ino: u64, generation: u64, data: &[u8]) -> std::io::Result<PathBuf> {
        let path = self.path_for(ino, generation);
        let mut file = File::create(&path)?;
        file.write_all(data)?;
        debug!(ino, generation, bytes = data.len(), "spilled dirty buffer");
        Ok(path)
    }

    /// Reads `len` bytes at `skip` from a spill file.
    pub fn read(&self, path: &Path, skip: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(skip))?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Removes a spill file; missing files are not an error.
    pub fn remove(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?path, %err, "failed to remove spill file");
            }
        }
    }

    /// Lists leftover spill files, as found after an unclean shutdown.
    pub fn scan(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("spill-") {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Removes every spill file. Called on orderly unmount.
    pub fn cleanup(&self) {
        match self.scan() {
            Ok(paths) => {
                for path in paths {
                    self.remove(&path);
                }
            }
            Err(err) => warn!(%err, "spill directory scan failed during cleanup"),
        }
    }
}
