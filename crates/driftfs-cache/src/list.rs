//! Ordered buffer list of one file.
//!
//! Buffers are non-overlapping, sorted by offset, and together cover the
//! readable extent of the file apart from ranges that only exist remotely.
//! Holes created by sparse writes are explicit `Zero` buffers; ranges that
//! were never fetched (or whose clean data was evicted) surface as
//! `Missing` segments in a read plan.
//!
//! Mutations go through carve-and-insert: any write first splits partially
//! overlapped buffers at the write bounds and removes the covered middle,
//! then inserts fresh `Dirty` buffers. A buffer being flushed is never
//! mutated in place; the covered part is simply removed, and the completed
//! flush acknowledgement no longer finds its generation, so it is ignored.

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::PathBuf;

use crate::buffer::{Buffer, BufferData, BufferState};
use crate::spill::SpillStore;

/// Memory and dirtiness accounting of one list, kept incrementally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Bytes of buffer data resident in memory.
    pub mem: u64,
    /// Memory-resident bytes in dirty states (pinned, not evictable).
    pub dirty_mem: u64,
    /// Logical bytes in dirty states, including spilled data.
    pub dirty_total: u64,
}

/// Snapshot handed to the flusher when buffers enter `Flushing`.
///
/// Completion applies only to buffers still carrying one of these
/// generations; anything superseded by a later write is left alone.
#[derive(Debug, Clone)]
pub struct FlushTicket {
    pub generations: Vec<u64>,
    pub bytes: u64,
}

/// One segment of a read plan, in ascending offset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSegment {
    /// Bytes available in memory (copied out under the lock).
    Memory { offset: u64, bytes: Vec<u8> },
    /// Bytes available in a spill file.
    Spilled {
        offset: u64,
        len: u64,
        path: PathBuf,
        skip: u64,
    },
    /// An explicit hole; reads as zeroes.
    Zero { offset: u64, len: u64 },
    /// Not present locally; must be fetched from the backend.
    Missing { offset: u64, len: u64 },
}

impl ReadSegment {
    pub fn offset(&self) -> u64 {
        match self {
            ReadSegment::Memory { offset, .. }
            | ReadSegment::Spilled { offset, .. }
            | ReadSegment::Zero { offset, .. }
            | ReadSegment::Missing { offset, .. } => *offset,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            ReadSegment::Memory { bytes, .. } => bytes.len() as u64,
            ReadSegment::Spilled { len, .. }
            | ReadSegment::Zero { len, .. }
            | ReadSegment::Missing { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The ordered buffer set of one file.
#[derive(Debug, Default)]
pub struct BufferList {
    map: BTreeMap<u64, Buffer>,
    size: u64,
    next_generation: u64,
    usage: Usage,
}

impl BufferList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical file size.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sets the logical size without touching buffers. Used when adopting
    /// the size of a remote object on first open.
    pub fn set_remote_size(&mut self, size: u64) {
        debug_assert!(self.map.is_empty());
        self.size = size;
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// True when no buffer holds unwritten data.
    pub fn is_clean(&self) -> bool {
        self.usage.dirty_total == 0
    }

    /// Offset of the first buffer still waiting to be flushed.
    pub fn min_unflushed_offset(&self) -> Option<u64> {
        self.map
            .values()
            .find(|b| matches!(b.state, BufferState::Dirty | BufferState::Queued))
            .map(|b| b.offset)
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn account_add(&mut self, buffer: &Buffer) {
        let mem = buffer.mem_bytes();
        self.usage.mem += mem;
        if buffer.state.is_dirty() {
            self.usage.dirty_total += buffer.len;
            self.usage.dirty_mem += mem;
        }
    }

    fn account_remove(&mut self, buffer: &Buffer) {
        let mem = buffer.mem_bytes();
        self.usage.mem -= mem;
        if buffer.state.is_dirty() {
            self.usage.dirty_total -= buffer.len;
            self.usage.dirty_mem -= mem;
        }
    }

    fn insert(&mut self, buffer: Buffer) {
        if buffer.len == 0 {
            return;
        }
        self.account_add(&buffer);
        self.map.insert(buffer.offset, buffer);
    }

    fn remove_at(&mut self, offset: u64) -> Buffer {
        let buffer = self.map.remove(&offset).expect("buffer offset present");
        self.account_remove(&buffer);
        buffer
    }

    /// Splits the buffer straddling `at` (if any and if `matches` allows)
    /// so that no matching buffer crosses the bound.
    fn split_bound(&mut self, at: u64, matches: &dyn Fn(&Buffer) -> bool) {
        let straddler = self
            .map
            .range(..at)
            .next_back()
            .filter(|(_, b)| b.end() > at && matches(b))
            .map(|(&o, _)| o);
        if let Some(offset) = straddler {
            let mut head = self.remove_at(offset);
            let tail = head.split_at(at);
            self.insert(head);
            self.insert(tail);
        }
    }

    /// Removes every matching buffer's coverage of `range`, splitting
    /// straddlers at the bounds first.
    fn carve_matching(&mut self, range: Range<u64>, matches: &dyn Fn(&Buffer) -> bool) {
        if range.start >= range.end {
            return;
        }
        self.split_bound(range.start, matches);
        self.split_bound(range.end, matches);
        let covered: Vec<u64> = self
            .map
            .range(range.clone())
            .filter(|(_, b)| matches(b))
            .map(|(&o, _)| o)
            .collect();
        for offset in covered {
            self.remove_at(offset);
        }
    }

    fn carve(&mut self, range: Range<u64>) {
        self.carve_matching(range, &|_| true);
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Applies a write. Overlapped buffers are superseded (last writer
    /// wins), a write past the current size materialises the gap as a
    /// `Zero` hole, and the new dirty data is chunked so no single buffer
    /// exceeds `max_buffer`.
    pub fn write(&mut self, offset: u64, data: &[u8], max_buffer: u64) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;
        if offset > self.size {
            let generation = self.bump();
            self.insert(Buffer::new(
                self.size,
                offset - self.size,
                BufferState::Zero,
                BufferData::Absent,
                generation,
            ));
        }
        self.carve(offset..end);

        let max = max_buffer.max(1) as usize;
        let mut pos = 0usize;
        while pos < data.len() {
            let chunk = (data.len() - pos).min(max);
            let generation = self.bump();
            self.insert(Buffer::new(
                offset + pos as u64,
                chunk as u64,
                BufferState::Dirty,
                BufferData::Memory(data[pos..pos + chunk].to_vec()),
                generation,
            ));
            pos += chunk;
        }

        self.coalesce_at(offset, max_buffer);
        self.coalesce_at(end, max_buffer);
        self.size = self.size.max(end);
    }

    /// Merges the dirty buffer ending at `bound` with the dirty buffer
    /// starting there, if both are memory-resident and the result stays
    /// within `max_buffer`.
    fn coalesce_at(&mut self, bound: u64, max_buffer: u64) {
        let left = match self.map.range(..bound).next_back() {
            Some((&o, b))
                if b.end() == bound
                    && b.state == BufferState::Dirty
                    && matches!(b.data, BufferData::Memory(_)) =>
            {
                o
            }
            _ => return,
        };
        let mergeable = matches!(
            self.map.get(&bound),
            Some(b)
                if b.state == BufferState::Dirty
                    && matches!(b.data, BufferData::Memory(_))
                    && b.len + self.map[&left].len <= max_buffer
        );
        if !mergeable {
            return;
        }
        let mut head = self.remove_at(left);
        let tail = self.remove_at(bound);
        if let (BufferData::Memory(head_data), BufferData::Memory(tail_data)) =
            (&mut head.data, tail.data)
        {
            head_data.extend_from_slice(&tail_data);
        }
        head.len += tail.len;
        head.generation = self.bump();
        self.insert(head);
    }

    /// Truncates or extends the file. Extension appends an explicit hole.
    pub fn truncate(&mut self, new_size: u64) {
        if new_size < self.size {
            self.carve(new_size..self.size);
            self.size = new_size;
        } else if new_size > self.size {
            let generation = self.bump();
            self.insert(Buffer::new(
                self.size,
                new_size - self.size,
                BufferState::Zero,
                BufferData::Absent,
                generation,
            ));
            self.size = new_size;
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Plans a read of `[offset, offset + len)`, clipped to the file size.
    /// Segments come back in offset order and cover the clipped range
    /// exactly.
    pub fn read_plan(&self, offset: u64, len: u64) -> Vec<ReadSegment> {
        let end = (offset.saturating_add(len)).min(self.size);
        let mut segments = Vec::new();
        if offset >= end {
            return segments;
        }

        let mut cursor = offset;
        let scan_from = self
            .map
            .range(..=offset)
            .next_back()
            .filter(|(_, b)| b.end() > offset)
            .map(|(&o, _)| o)
            .unwrap_or(offset);

        for (_, buffer) in self.map.range(scan_from..end) {
            if buffer.end() <= cursor {
                continue;
            }
            if buffer.offset >= end {
                break;
            }
            if buffer.offset > cursor {
                segments.push(ReadSegment::Missing {
                    offset: cursor,
                    len: buffer.offset - cursor,
                });
                cursor = buffer.offset;
            }
            let seg_end = buffer.end().min(end);
            let seg_len = seg_end - cursor;
            let within = cursor - buffer.offset;
            match (&buffer.state, &buffer.data) {
                (BufferState::Zero, _) => segments.push(ReadSegment::Zero {
                    offset: cursor,
                    len: seg_len,
                }),
                (_, BufferData::Memory(data)) => segments.push(ReadSegment::Memory {
                    offset: cursor,
                    bytes: data[within as usize..(within + seg_len) as usize].to_vec(),
                }),
                (_, BufferData::Spilled { path, skip }) => segments.push(ReadSegment::Spilled {
                    offset: cursor,
                    len: seg_len,
                    path: path.clone(),
                    skip: skip + within,
                }),
                (_, BufferData::Absent) => segments.push(ReadSegment::Missing {
                    offset: cursor,
                    len: seg_len,
                }),
            }
            cursor = seg_end;
        }
        if cursor < end {
            segments.push(ReadSegment::Missing {
                offset: cursor,
                len: end - cursor,
            });
        }
        segments
    }

    /// True when `[start, end)` carries no locally written data: every
    /// overlapping buffer is `Clean` and gaps are merely unfetched remote
    /// ranges. Such a range is byte-identical to the remote object, so a
    /// flush may cover it with a server-side part copy instead of
    /// re-sending the bytes.
    pub fn is_remote_clean(&self, range: Range<u64>) -> bool {
        if range.start >= range.end {
            return true;
        }
        let scan_from = self
            .map
            .range(..=range.start)
            .next_back()
            .filter(|(_, b)| b.end() > range.start)
            .map(|(&o, _)| o)
            .unwrap_or(range.start);
        for (_, buffer) in self.map.range(scan_from..range.end) {
            if buffer.end() <= range.start {
                continue;
            }
            if buffer.offset >= range.end {
                break;
            }
            if buffer.state != BufferState::Clean {
                return false;
            }
        }
        true
    }

    /// Installs fetched bytes as `Clean` buffers. Only gaps and evicted
    /// clean ranges are filled; dirty, flushing and hole data always wins
    /// over what the backend returned.
    pub fn install_clean(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let end = offset + data.len() as u64;
        // Re-materialise evicted clean ranges.
        self.carve_matching(offset..end, &|b| {
            b.state == BufferState::Clean && b.data == BufferData::Absent
        });

        // Fill every remaining gap from the fetched bytes.
        let gaps: Vec<(u64, u64)> = self
            .read_plan(offset, data.len() as u64)
            .into_iter()
            .filter_map(|segment| match segment {
                ReadSegment::Missing { offset, len } => Some((offset, len)),
                _ => None,
            })
            .collect();
        for (gap_offset, gap_len) in gaps {
            let from = (gap_offset - offset) as usize;
            let generation = self.bump();
            self.insert(Buffer::new(
                gap_offset,
                gap_len,
                BufferState::Clean,
                BufferData::Memory(data[from..from + gap_len as usize].to_vec()),
                generation,
            ));
        }
    }

    // ========================================================================
    // Flushing
    // ========================================================================

    /// Marks every dirty buffer within `range` as `Flushing` and returns
    /// the ticket identifying the captured generations. Straddling buffers
    /// are split at the range bounds first.
    pub fn mark_flushing(&mut self, range: Range<u64>, part_number: Option<u32>) -> FlushTicket {
        self.split_bound(range.start, &|_| true);
        self.split_bound(range.end, &|_| true);
        let mut generations = Vec::new();
        let mut bytes = 0;
        let dirty: Vec<u64> = self
            .map
            .range(range)
            .filter(|(_, b)| matches!(b.state, BufferState::Dirty | BufferState::Queued))
            .map(|(&o, _)| o)
            .collect();
        for offset in dirty {
            let mut buffer = self.remove_at(offset);
            buffer.state = BufferState::Flushing;
            buffer.part_number = part_number;
            // Fresh generation per ticket: two outstanding tickets must
            // never acknowledge each other's buffers, even if both ranges
            // came from one original write.
            buffer.generation = self.bump();
            generations.push(buffer.generation);
            bytes += buffer.len;
            self.insert(buffer);
        }
        FlushTicket { generations, bytes }
    }

    /// Applies a successful flush: every buffer still carrying a ticket
    /// generation becomes `Clean`. Spilled data is dropped (the object now
    /// holds the bytes); the caller unlinks the spill files. Returns the
    /// spill paths to remove.
    pub fn complete_flush(&mut self, ticket: &FlushTicket) -> Vec<PathBuf> {
        let mut spilled = Vec::new();
        let matching: Vec<u64> = self
            .map
            .values()
            .filter(|b| b.state == BufferState::Flushing && ticket.generations.contains(&b.generation))
            .map(|b| b.offset)
            .collect();
        for offset in matching {
            let mut buffer = self.remove_at(offset);
            buffer.state = BufferState::Clean;
            buffer.part_number = None;
            if let BufferData::Spilled { path, .. } = &buffer.data {
                spilled.push(path.clone());
                buffer.data = BufferData::Absent;
            }
            self.insert(buffer);
        }
        spilled
    }

    /// Reverts a failed flush: ticket buffers go back to `Dirty` (or
    /// `Queued` when their bytes sit in a spill file).
    pub fn fail_flush(&mut self, ticket: &FlushTicket) {
        let matching: Vec<u64> = self
            .map
            .values()
            .filter(|b| b.state == BufferState::Flushing && ticket.generations.contains(&b.generation))
            .map(|b| b.offset)
            .collect();
        for offset in matching {
            let mut buffer = self.remove_at(offset);
            buffer.state = match buffer.data {
                BufferData::Spilled { .. } => BufferState::Queued,
                _ => BufferState::Dirty,
            };
            buffer.part_number = None;
            self.insert(buffer);
        }
    }

    // ========================================================================
    // Memory management
    // ========================================================================

    /// Drops the data of clean buffers in ascending offset order until
    /// `target` bytes were freed. The range bookkeeping survives so a later
    /// read re-fetches.
    pub fn evict_clean(&mut self, target: u64) -> u64 {
        let mut freed = 0;
        let candidates: Vec<u64> = self
            .map
            .values()
            .filter(|b| b.state == BufferState::Clean && matches!(b.data, BufferData::Memory(_)))
            .map(|b| b.offset)
            .collect();
        for offset in candidates {
            if freed >= target {
                break;
            }
            let mut buffer = self.remove_at(offset);
            freed += buffer.mem_bytes();
            buffer.data = BufferData::Absent;
            self.insert(buffer);
        }
        freed
    }

    /// Removes every clean buffer outright. Used when the remote object
    /// changed under us and cached data can no longer be trusted.
    pub fn drop_clean(&mut self) {
        let clean: Vec<u64> = self
            .map
            .values()
            .filter(|b| b.state == BufferState::Clean)
            .map(|b| b.offset)
            .collect();
        for offset in clean {
            self.remove_at(offset);
        }
    }

    /// Spills memory-resident dirty buffers to disk until `target` bytes
    /// of memory were released. Spilled buffers move to `Queued`.
    pub fn spill_dirty(
        &mut self,
        ino: u64,
        store: &SpillStore,
        target: u64,
    ) -> std::io::Result<u64> {
        let mut freed = 0;
        let candidates: Vec<u64> = self
            .map
            .values()
            .filter(|b| b.state == BufferState::Dirty && matches!(b.data, BufferData::Memory(_)))
            .map(|b| b.offset)
            .collect();
        for offset in candidates {
            if freed >= target {
                break;
            }
            let mut buffer = self.remove_at(offset);
            let path = match &buffer.data {
                BufferData::Memory(data) => {
                    let path = store.write(ino, buffer.generation, data)?;
                    freed += data.len() as u64;
                    path
                }
                _ => unreachable!("candidate filter admits only memory data"),
            };
            buffer.data = BufferData::Spilled { path, skip: 0 };
            buffer.state = BufferState::Queued;
            self.insert(buffer);
        }
        Ok(freed)
    }

    /// Panics if the ordering or coverage invariants are violated.
    /// Exercised by the test suites after every mutation sequence.
    pub fn check_invariants(&self) {
        let mut previous_end = 0;
        for (offset, buffer) in &self.map {
            assert_eq!(*offset, buffer.offset, "map key matches buffer offset");
            assert!(buffer.len > 0, "no empty buffers");
            assert!(buffer.offset >= previous_end, "buffers must not overlap");
            assert!(buffer.end() <= self.size, "buffer beyond file size");
            previous_end = buffer.end();
        }
        let mut usage = Usage::default();
        for buffer in self.map.values() {
            usage.mem += buffer.mem_bytes();
            if buffer.state.is_dirty() {
                usage.dirty_total += buffer.len;
                usage.dirty_mem += buffer.mem_bytes();
            }
        }
        assert_eq!(usage, self.usage, "incremental accounting drifted");
    }

    #[cfg(test)]
    pub(crate) fn states(&self) -> Vec<(u64, u64, BufferState)> {
        self.map
            .values()
            .map(|b| (b.offset, b.len, b.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 1 << 20;

    /// Renders a plan into bytes, zero-filling holes; panics on `Missing`.
    fn render(plan: &[ReadSegment]) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in plan {
            match segment {
                ReadSegment::Memory { bytes, .. } => out.extend_from_slice(bytes),
                ReadSegment::Zero { len, .. } => out.extend(std::iter::repeat(0).take(*len as usize)),
                other => panic!("unexpected segment: {other:?}"),
            }
        }
        out
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let mut list = BufferList::new();
        list.write(0, b"hello world", MAX);
        list.check_invariants();

        assert_eq!(list.size(), 11);
        assert_eq!(render(&list.read_plan(0, 11)), b"hello world");
        assert_eq!(render(&list.read_plan(6, 5)), b"world");
    }

    #[test]
    fn test_read_clips_to_size() {
        let mut list = BufferList::new();
        list.write(0, b"abc", MAX);
        let plan = list.read_plan(1, 100);
        assert_eq!(render(&plan), b"bc");
        assert!(list.read_plan(3, 10).is_empty());
    }

    #[test]
    fn test_overlapping_write_last_writer_wins() {
        let mut list = BufferList::new();
        list.write(0, &[0xAA; 1024], MAX);
        list.write(512, &[0xBB; 1024], MAX);
        list.check_invariants();

        let bytes = render(&list.read_plan(0, 1536));
        assert!(bytes[..512].iter().all(|&b| b == 0xAA));
        assert!(bytes[512..].iter().all(|&b| b == 0xBB));
        assert_eq!(list.size(), 1536);
    }

    #[test]
    fn test_write_past_eof_creates_hole() {
        let mut list = BufferList::new();
        list.write(0, b"head", MAX);
        list.write(100, b"tail", MAX);
        list.check_invariants();

        let plan = list.read_plan(0, 104);
        assert!(plan
            .iter()
            .any(|s| matches!(s, ReadSegment::Zero { offset: 4, len: 96 })));
        let bytes = render(&plan);
        assert_eq!(&bytes[..4], b"head");
        assert!(bytes[4..100].iter().all(|&b| b == 0));
        assert_eq!(&bytes[100..], b"tail");
    }

    #[test]
    fn test_unfetched_range_is_missing() {
        let mut list = BufferList::new();
        list.set_remote_size(100);
        let plan = list.read_plan(10, 20);
        assert_eq!(
            plan,
            vec![ReadSegment::Missing {
                offset: 10,
                len: 20
            }]
        );
    }

    #[test]
    fn test_install_clean_fills_gap_only() {
        let mut list = BufferList::new();
        list.set_remote_size(10);
        list.write(4, b"XX", MAX);
        list.install_clean(0, b"0123456789");
        list.check_invariants();

        let bytes = render(&list.read_plan(0, 10));
        assert_eq!(&bytes, b"0123XX6789");
        // The dirty overlay survived.
        assert_eq!(list.usage().dirty_total, 2);
    }

    #[test]
    fn test_install_clean_refills_evicted_range() {
        let mut list = BufferList::new();
        list.write(0, b"abcdef", MAX);
        let ticket = list.mark_flushing(0..6, None);
        list.complete_flush(&ticket);
        assert_eq!(list.evict_clean(u64::MAX), 6);

        assert!(matches!(
            list.read_plan(0, 6)[0],
            ReadSegment::Missing { .. }
        ));
        list.install_clean(0, b"abcdef");
        list.check_invariants();
        assert_eq!(render(&list.read_plan(0, 6)), b"abcdef");
    }

    #[test]
    fn test_dirty_chunking_respects_max_buffer() {
        let mut list = BufferList::new();
        list.write(0, &[1; 10_000], 4096);
        list.check_invariants();
        for (_, len, state) in list.states() {
            assert!(len <= 4096);
            assert_eq!(state, BufferState::Dirty);
        }
    }

    #[test]
    fn test_adjacent_dirty_writes_coalesce() {
        let mut list = BufferList::new();
        list.write(0, &[1; 100], MAX);
        list.write(100, &[2; 100], MAX);
        list.check_invariants();
        assert_eq!(list.states().len(), 1);
        assert_eq!(list.states()[0].1, 200);
    }

    #[test]
    fn test_coalescing_never_exceeds_max_buffer() {
        let mut list = BufferList::new();
        list.write(0, &[1; 100], 150);
        list.write(100, &[2; 100], 150);
        list.check_invariants();
        assert_eq!(list.states().len(), 2);
    }

    #[test]
    fn test_flush_cycle_marks_clean() {
        let mut list = BufferList::new();
        list.write(0, b"data", MAX);
        let ticket = list.mark_flushing(0..4, None);
        assert_eq!(ticket.bytes, 4);
        assert_eq!(list.states()[0].2, BufferState::Flushing);
        assert_eq!(list.usage().dirty_total, 4);

        let spilled = list.complete_flush(&ticket);
        list.check_invariants();
        assert!(spilled.is_empty());
        assert_eq!(list.states()[0].2, BufferState::Clean);
        assert!(list.is_clean());
    }

    #[test]
    fn test_failed_flush_returns_to_dirty() {
        let mut list = BufferList::new();
        list.write(0, b"data", MAX);
        let ticket = list.mark_flushing(0..4, Some(1));
        list.fail_flush(&ticket);
        list.check_invariants();
        assert_eq!(list.states()[0].2, BufferState::Dirty);
        assert_eq!(list.usage().dirty_total, 4);
    }

    #[test]
    fn test_superseding_write_rejects_stale_flush_ack() {
        let mut list = BufferList::new();
        list.write(0, &[1; 8], MAX);
        let ticket = list.mark_flushing(0..8, None);

        // Overwrite the middle while the flush is in flight.
        list.write(2, &[9; 4], MAX);
        list.check_invariants();

        list.complete_flush(&ticket);
        list.check_invariants();

        // The untouched edges became clean, the superseding write stayed
        // dirty and kept its content.
        assert_eq!(list.usage().dirty_total, 4);
        let bytes = render(&list.read_plan(0, 8));
        assert_eq!(bytes, vec![1, 1, 9, 9, 9, 9, 1, 1]);
        let states = list.states();
        assert_eq!(states[0].2, BufferState::Clean);
        assert_eq!(states[1].2, BufferState::Dirty);
        assert_eq!(states[2].2, BufferState::Clean);
    }

    #[test]
    fn test_partial_flush_of_range() {
        let mut list = BufferList::new();
        list.write(0, &[1; 100], MAX);
        let ticket = list.mark_flushing(0..40, Some(1));
        assert_eq!(ticket.bytes, 40);
        list.check_invariants();

        list.complete_flush(&ticket);
        assert_eq!(list.usage().dirty_total, 60);
        assert_eq!(list.min_unflushed_offset(), Some(40));
    }

    #[test]
    fn test_truncate_down_discards_buffers() {
        let mut list = BufferList::new();
        list.write(0, &[1; 100], MAX);
        list.truncate(30);
        list.check_invariants();
        assert_eq!(list.size(), 30);
        assert_eq!(list.usage().dirty_total, 30);
    }

    #[test]
    fn test_truncate_up_appends_hole() {
        let mut list = BufferList::new();
        list.write(0, b"abc", MAX);
        list.truncate(10);
        list.check_invariants();
        assert_eq!(list.size(), 10);
        let bytes = render(&list.read_plan(0, 10));
        assert_eq!(&bytes[..3], b"abc");
        assert!(bytes[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_evict_clean_keeps_range_bookkeeping() {
        let mut list = BufferList::new();
        list.write(0, &[1; 64], MAX);
        let ticket = list.mark_flushing(0..64, None);
        list.complete_flush(&ticket);

        let freed = list.evict_clean(u64::MAX);
        list.check_invariants();
        assert_eq!(freed, 64);
        assert_eq!(list.usage().mem, 0);
        // Still one buffer, now a pure range declaration.
        assert_eq!(list.states().len(), 1);
        assert!(matches!(
            list.read_plan(0, 64)[0],
            ReadSegment::Missing { .. }
        ));
    }

    #[test]
    fn test_evict_skips_dirty() {
        let mut list = BufferList::new();
        list.write(0, &[1; 64], MAX);
        assert_eq!(list.evict_clean(u64::MAX), 0);
        assert_eq!(list.usage().dirty_mem, 64);
    }

    #[test]
    fn test_spill_dirty_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path().to_path_buf()).unwrap();
        let mut list = BufferList::new();
        list.write(0, b"spill me", MAX);

        let freed = list.spill_dirty(42, &store, u64::MAX).unwrap();
        list.check_invariants();
        assert_eq!(freed, 8);
        assert_eq!(list.usage().mem, 0);
        assert_eq!(list.usage().dirty_total, 8);
        assert_eq!(list.states()[0].2, BufferState::Queued);

        // The plan points into the spill file.
        match &list.read_plan(2, 4)[0] {
            ReadSegment::Spilled { path, skip, len, .. } => {
                assert_eq!(*skip, 2);
                assert_eq!(*len, 4);
                assert_eq!(store.read(path, *skip, *len).unwrap(), b"ill ");
            }
            other => panic!("unexpected segment: {other:?}"),
        }
    }

    #[test]
    fn test_spilled_flush_completion_reports_spill_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = SpillStore::new(dir.path().to_path_buf()).unwrap();
        let mut list = BufferList::new();
        list.write(0, b"spill me", MAX);
        list.spill_dirty(42, &store, u64::MAX).unwrap();

        let ticket = list.mark_flushing(0..8, Some(1));
        let spilled = list.complete_flush(&ticket);
        list.check_invariants();
        assert_eq!(spilled.len(), 1);
        assert!(list.is_clean());
    }

    #[test]
    fn test_remote_clean_detection() {
        let mut list = BufferList::new();
        list.set_remote_size(100);
        // Nothing local at all: the whole extent is remote-clean.
        assert!(list.is_remote_clean(0..100));

        list.install_clean(10, &[5; 20]);
        assert!(list.is_remote_clean(0..100));

        list.write(40, &[9; 8], MAX);
        assert!(!list.is_remote_clean(0..100));
        assert!(!list.is_remote_clean(32..48));
        assert!(list.is_remote_clean(0..40));
        assert!(list.is_remote_clean(48..100));

        // Flushing data is still local data.
        let ticket = list.mark_flushing(40..48, Some(1));
        assert!(!list.is_remote_clean(32..48));
        list.complete_flush(&ticket);
        assert!(list.is_remote_clean(32..48));
    }

    #[test]
    fn test_zero_holes_are_not_remote_clean() {
        let mut list = BufferList::new();
        list.set_remote_size(10);
        list.truncate(20);
        assert!(list.is_remote_clean(0..10));
        assert!(!list.is_remote_clean(0..20));
    }

    #[test]
    fn test_drop_clean_removes_coverage() {
        let mut list = BufferList::new();
        list.set_remote_size(8);
        list.install_clean(0, b"12345678");
        list.drop_clean();
        list.check_invariants();
        assert!(list.states().is_empty());
        assert!(matches!(
            list.read_plan(0, 8)[0],
            ReadSegment::Missing { .. }
        ));
    }
}
