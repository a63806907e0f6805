//! A single cached byte range of a file.

use std::path::PathBuf;

/// Lifecycle state of a buffer.
///
/// `Dirty` and `Flushing` buffers pin their memory; `Clean` data can be
/// dropped at any time and re-fetched. `Queued` is dirty data whose bytes
/// were spilled to disk under memory pressure and now wait for the flusher.
/// `Zero` is a hole materialised on demand; it never carries data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Clean,
    Dirty,
    Queued,
    Flushing,
    Zero,
}

impl BufferState {
    /// True for states that still hold unwritten user data.
    pub fn is_dirty(&self) -> bool {
        matches!(self, BufferState::Dirty | BufferState::Queued | BufferState::Flushing)
    }
}

/// Where a buffer's bytes live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferData {
    /// Resident in memory.
    Memory(Vec<u8>),
    /// Spilled to a file; `skip` is this buffer's offset within it.
    Spilled { path: PathBuf, skip: u64 },
    /// No bytes held. Valid for `Clean` after eviction and always for `Zero`.
    Absent,
}

/// A contiguous byte range of one file.
///
/// The generation is bumped on every mutation and identifies the exact
/// content snapshot a flush captured; a flush acknowledgement only applies
/// to buffers still carrying its generation.
#[derive(Debug, Clone)]
pub struct Buffer {
    pub offset: u64,
    pub len: u64,
    pub state: BufferState,
    pub data: BufferData,
    pub generation: u64,
    /// Part index assigned while flushing via multipart.
    pub part_number: Option<u32>,
}

impl Buffer {
    pub fn new(offset: u64, len: u64, state: BufferState, data: BufferData, generation: u64) -> Self {
        Self {
            offset,
            len,
            state,
            data,
            generation,
            part_number: None,
        }
    }

    /// One past the last byte covered.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Bytes of memory this buffer pins.
    pub fn mem_bytes(&self) -> u64 {
        match &self.data {
            BufferData::Memory(data) => data.len() as u64,
            _ => 0,
        }
    }

    /// Splits the buffer at absolute offset `at`, keeping `[offset, at)` in
    /// `self` and returning `[at, end)`. Both halves keep the generation:
    /// they still carry the same content snapshot.
    pub fn split_at(&mut self, at: u64) -> Buffer {
        debug_assert!(at > self.offset && at < self.end());
        let head_len = at - self.offset;
        let tail_data = match &mut self.data {
            BufferData::Memory(data) => BufferData::Memory(data.split_off(head_len as usize)),
            BufferData::Spilled { path, skip } => BufferData::Spilled {
                path: path.clone(),
                skip: *skip + head_len,
            },
            BufferData::Absent => BufferData::Absent,
        };
        let tail = Buffer {
            offset: at,
            len: self.len - head_len,
            state: self.state,
            data: tail_data,
            generation: self.generation,
            part_number: self.part_number,
        };
        self.len = head_len;
        tail
    }
}
