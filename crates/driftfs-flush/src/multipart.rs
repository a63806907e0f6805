//! Per-file multipart upload state.
//!
//! Exists only while an upload is in flight; commit or abort is the only
//! way out. Part numbers are assigned monotonically as ranges of the file
//! are handed to upload tasks; the etag map fills in as parts acknowledge.

use std::collections::BTreeMap;

use driftfs_cache::FlushTicket;
use driftfs_core::domain::{Etag, ObjectKey, UploadId};
use driftfs_core::ports::{Metadata, MultipartPart};

/// State of one in-flight multipart upload.
#[derive(Debug)]
pub struct MultipartState {
    pub upload_id: UploadId,
    /// Target key at the time the upload began.
    pub key: ObjectKey,
    /// Metadata snapshot taken at upload start.
    pub metadata: Metadata,
    /// part number -> etag, filled as parts acknowledge.
    pub parts: BTreeMap<u32, Etag>,
    /// Next part number to assign.
    pub next_part: u32,
    /// Bytes of the file already covered by assigned parts.
    pub assigned_bytes: u64,
    /// Flush tickets of every assigned part. Buffers stay pinned in
    /// `Flushing` until commit; an abort fails them all back to dirty.
    pub tickets: Vec<FlushTicket>,
}

impl MultipartState {
    pub fn new(upload_id: UploadId, key: ObjectKey, metadata: Metadata) -> Self {
        Self {
            upload_id,
            key,
            metadata,
            parts: BTreeMap::new(),
            next_part: 1,
            assigned_bytes: 0,
            tickets: Vec::new(),
        }
    }

    /// Assigns the next part number and advances the byte cursor.
    pub fn assign_part(&mut self, len: u64, ticket: FlushTicket) -> u32 {
        let number = self.next_part;
        self.next_part += 1;
        self.assigned_bytes += len;
        self.tickets.push(ticket);
        number
    }

    /// Records a part acknowledgement.
    pub fn record_ack(&mut self, number: u32, etag: Etag) {
        debug_assert!(number < self.next_part, "ack for unassigned part");
        self.parts.insert(number, etag);
    }

    /// True once every assigned part has acknowledged.
    pub fn all_acked(&self) -> bool {
        self.parts.len() as u32 == self.next_part - 1
    }

    /// The ordered part list for the commit call.
    pub fn commit_parts(&self) -> Vec<MultipartPart> {
        self.parts
            .iter()
            .map(|(&number, etag)| MultipartPart {
                number,
                etag: etag.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticket() -> FlushTicket {
        FlushTicket {
            generations: vec![1],
            bytes: 8,
        }
    }

    #[test]
    fn test_part_numbers_are_monotonic() {
        let mut upload = MultipartState::new(
            UploadId::new("u1"),
            ObjectKey::new("big.bin").unwrap(),
            Metadata::new(),
        );
        assert_eq!(upload.assign_part(8, ticket()), 1);
        assert_eq!(upload.assign_part(8, ticket()), 2);
        assert_eq!(upload.assign_part(4, ticket()), 3);
        assert_eq!(upload.assigned_bytes, 20);
    }

    #[test]
    fn test_ack_tracking_and_commit_order() {
        let mut upload = MultipartState::new(
            UploadId::new("u1"),
            ObjectKey::new("big.bin").unwrap(),
            Metadata::new(),
        );
        upload.assign_part(8, ticket());
        upload.assign_part(8, ticket());
        assert!(!upload.all_acked());

        // Acks may land out of order; the commit list is sorted anyway.
        upload.record_ack(2, Etag::new("e2"));
        upload.record_ack(1, Etag::new("e1"));
        assert!(upload.all_acked());

        let parts = upload.commit_parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].number, 1);
        assert_eq!(parts[1].number, 2);
    }
}
