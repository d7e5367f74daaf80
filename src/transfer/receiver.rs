//! Receiver side of the chunked transfer protocol.
//!
//! State machine: `Receiving -> Complete | Aborted`. There is no explicit
//! awaiting-begin state: a receiver is created from the `FileBegin`
//! announcement, and chunk frames for unknown transfer ids are logged and
//! dropped.
//!
//! Chunks are applied by index into a preallocated buffer, so arrival order
//! never matters and a re-delivered index is a no-op (presence-checked, not
//! reapplied). The receiver acks its contiguous watermark after every
//! `ack_batch` chunks and once more on completion. A full index set triggers
//! checksum verification; a mismatch transitions to `Aborted` and never to
//! `Complete`.

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ControlMessage, FileErrorReason};
use crate::transfer::chunk::{file_checksum, ChunkBitmap};

/// Receiver-side transfer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Receiving,
    Complete,
    Aborted,
}

/// Result of applying one chunk frame.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Chunk applied; nothing to send yet.
    Applied,
    /// Index already present; frame ignored.
    Duplicate,
    /// Malformed frame (bad index or length); frame ignored.
    Rejected,
    /// Ack batch reached: send this ack.
    Ack(ControlMessage),
    /// Full set present and checksum verified. Carries the reassembled
    /// bytes and the final ack to send.
    Complete { data: Bytes, ack: ControlMessage },
    /// Full set present but checksum mismatched. Carries the error to send.
    Abort(ControlMessage),
}

/// One inbound file transfer.
pub struct TransferReceiver {
    id: Uuid,
    total_size: u64,
    chunk_size: u32,
    checksum: [u8; 32],
    bitmap: ChunkBitmap,
    buffer: Vec<u8>,
    since_last_ack: u32,
    ack_batch: u32,
    state: ReceiverState,
}

impl TransferReceiver {
    /// Build a receiver from a `FileBegin` announcement.
    ///
    /// Returns `None` when the announced geometry is inconsistent
    /// (chunk_count not matching total_size / chunk_size) or the announced
    /// size exceeds `max_size` — the reassembly buffer is preallocated, so
    /// the peer's claim is never trusted unboundedly.
    pub fn from_begin(
        transfer_id: Uuid,
        total_size: u64,
        chunk_size: u32,
        chunk_count: u32,
        checksum: [u8; 32],
        ack_batch: u32,
        max_size: u64,
    ) -> Option<Self> {
        if chunk_size == 0 {
            return None;
        }
        if total_size > max_size {
            warn!(
                event = "transfer_begin_rejected",
                transfer_id = %transfer_id,
                total_size,
                max_size,
                "Announced size exceeds the receive limit"
            );
            return None;
        }
        if total_size.div_ceil(chunk_size as u64) != chunk_count as u64 {
            warn!(
                event = "transfer_begin_rejected",
                transfer_id = %transfer_id,
                total_size,
                chunk_size,
                chunk_count,
                "Inconsistent transfer geometry"
            );
            return None;
        }
        info!(
            event = "transfer_announced",
            transfer_id = %transfer_id,
            bytes = total_size,
            chunks = chunk_count,
            "Incoming file transfer"
        );
        Some(Self {
            id: transfer_id,
            total_size,
            chunk_size,
            checksum,
            bitmap: ChunkBitmap::new(chunk_count),
            buffer: vec![0u8; total_size as usize],
            since_last_ack: 0,
            ack_batch: ack_batch.max(1),
            state: ReceiverState::Receiving,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn chunk_count(&self) -> u32 {
        self.bitmap.chunk_count()
    }

    pub fn received_chunks(&self) -> u32 {
        self.bitmap.received_count()
    }

    /// Expected byte length of the chunk at `index` (the last may be short).
    fn expected_len(&self, index: u32) -> usize {
        let start = index as u64 * self.chunk_size as u64;
        (self.chunk_size as u64).min(self.total_size - start) as usize
    }

    /// An announced transfer with zero chunks already holds its full
    /// (empty) index set; settle it without waiting for chunk frames that
    /// will never come. One-shot: returns `None` once settled.
    pub fn settle_if_empty(&mut self) -> Option<ChunkOutcome> {
        if self.state == ReceiverState::Receiving && self.bitmap.chunk_count() == 0 {
            return Some(self.finalize());
        }
        None
    }

    fn ack_message(&self) -> ControlMessage {
        ControlMessage::FileAck {
            transfer_id: self.id,
            watermark: self.bitmap.contiguous_watermark(),
        }
    }

    /// Apply one chunk frame.
    pub fn accept_chunk(&mut self, index: u32, data: &[u8]) -> ChunkOutcome {
        if self.state != ReceiverState::Receiving {
            return ChunkOutcome::Rejected;
        }
        if index >= self.bitmap.chunk_count() {
            warn!(
                event = "chunk_index_out_of_range",
                transfer_id = %self.id,
                index,
                chunks = self.bitmap.chunk_count(),
                "Dropping out-of-range chunk"
            );
            return ChunkOutcome::Rejected;
        }
        if self.bitmap.is_set(index) {
            debug!(
                event = "chunk_duplicate",
                transfer_id = %self.id,
                index,
                "Ignoring re-delivered chunk"
            );
            return ChunkOutcome::Duplicate;
        }
        if data.len() != self.expected_len(index) {
            warn!(
                event = "chunk_length_mismatch",
                transfer_id = %self.id,
                index,
                got = data.len(),
                expected = self.expected_len(index),
                "Dropping malformed chunk"
            );
            return ChunkOutcome::Rejected;
        }

        let start = index as usize * self.chunk_size as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.bitmap.set(index);
        self.since_last_ack += 1;

        if self.bitmap.is_complete() {
            return self.finalize();
        }
        if self.since_last_ack >= self.ack_batch {
            self.since_last_ack = 0;
            return ChunkOutcome::Ack(self.ack_message());
        }
        ChunkOutcome::Applied
    }

    /// All indices present: verify the checksum and settle the transfer.
    fn finalize(&mut self) -> ChunkOutcome {
        let computed = file_checksum(&self.buffer);
        if computed != self.checksum {
            self.state = ReceiverState::Aborted;
            warn!(
                event = "transfer_checksum_mismatch",
                transfer_id = %self.id,
                "Reassembled bytes do not match announced checksum"
            );
            let buffer = std::mem::take(&mut self.buffer);
            drop(buffer);
            return ChunkOutcome::Abort(ControlMessage::FileError {
                transfer_id: self.id,
                reason: FileErrorReason::ChecksumMismatch,
            });
        }
        self.state = ReceiverState::Complete;
        let ack = ControlMessage::FileAck {
            transfer_id: self.id,
            watermark: self.bitmap.chunk_count(),
        };
        info!(
            event = "transfer_received",
            transfer_id = %self.id,
            bytes = self.total_size,
            "File reassembled and checksum verified"
        );
        ChunkOutcome::Complete {
            data: Bytes::from(std::mem::take(&mut self.buffer)),
            ack,
        }
    }

    /// Abort locally (session close). Discards the reassembly buffer.
    pub fn abort(&mut self) {
        if self.state == ReceiverState::Receiving {
            self.state = ReceiverState::Aborted;
            self.buffer = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlMessage;

    fn make(data: &[u8], chunk_size: u32, ack_batch: u32) -> (TransferReceiver, Vec<Vec<u8>>) {
        let checksum = file_checksum(data);
        let chunk_count = (data.len() as u64).div_ceil(chunk_size as u64) as u32;
        let rx = TransferReceiver::from_begin(
            Uuid::new_v4(),
            data.len() as u64,
            chunk_size,
            chunk_count,
            checksum,
            ack_batch,
            u64::MAX,
        )
        .unwrap();
        let chunks = data
            .chunks(chunk_size as usize)
            .map(|c| c.to_vec())
            .collect();
        (rx, chunks)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    #[test]
    fn in_order_delivery_reconstructs_content() {
        let data = payload(4096 * 3 + 17);
        let (mut rx, chunks) = make(&data, 4096, 100);

        for (i, chunk) in chunks.iter().enumerate().take(chunks.len() - 1) {
            assert!(matches!(
                rx.accept_chunk(i as u32, chunk),
                ChunkOutcome::Applied
            ));
        }
        match rx.accept_chunk(chunks.len() as u32 - 1, chunks.last().unwrap()) {
            ChunkOutcome::Complete { data: got, ack } => {
                assert_eq!(&got[..], &data[..]);
                assert!(matches!(
                    ack,
                    ControlMessage::FileAck { watermark: 4, .. }
                ));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(rx.state(), ReceiverState::Complete);
    }

    #[test]
    fn any_permutation_reconstructs_content() {
        let data = payload(256 * 6);
        // A handful of adversarial orders, including fully reversed.
        let orders: [&[u32]; 4] = [
            &[5, 4, 3, 2, 1, 0],
            &[0, 2, 1, 4, 3, 5],
            &[3, 0, 5, 1, 4, 2],
            &[1, 5, 0, 4, 2, 3],
        ];
        for order in orders {
            let (mut rx, chunks) = make(&data, 256, 100);
            let mut completed = None;
            for &i in order {
                match rx.accept_chunk(i, &chunks[i as usize]) {
                    ChunkOutcome::Complete { data, .. } => completed = Some(data),
                    ChunkOutcome::Applied | ChunkOutcome::Ack(_) => {
                        // Completion must only fire on the last index.
                        assert!(rx.received_chunks() < rx.chunk_count());
                    }
                    other => panic!("unexpected outcome: {other:?}"),
                }
            }
            assert_eq!(&completed.expect("transfer must complete")[..], &data[..]);
        }
    }

    #[test]
    fn duplicate_delivery_is_noop() {
        let data = payload(512 * 4);
        let (mut rx, chunks) = make(&data, 512, 100);

        assert!(matches!(
            rx.accept_chunk(0, &chunks[0]),
            ChunkOutcome::Applied
        ));
        // Same index again, even with different bytes: presence-checked no-op.
        let garbage = vec![0xFFu8; 512];
        assert!(matches!(
            rx.accept_chunk(0, &garbage),
            ChunkOutcome::Duplicate
        ));

        for i in 1..4u32 {
            let _ = rx.accept_chunk(i, &chunks[i as usize]);
        }
        assert_eq!(rx.state(), ReceiverState::Complete);
    }

    #[test]
    fn acks_after_every_batch() {
        let data = payload(128 * 10);
        let (mut rx, chunks) = make(&data, 128, 4);

        let mut acks = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            match rx.accept_chunk(i as u32, chunk) {
                ChunkOutcome::Ack(ControlMessage::FileAck { watermark, .. }) => {
                    acks.push(watermark)
                }
                ChunkOutcome::Complete { ack, .. } => {
                    if let ControlMessage::FileAck { watermark, .. } = ack {
                        acks.push(watermark);
                    }
                }
                _ => {}
            }
        }
        // Batches of 4: acks at 4, 8, and the final ack at 10.
        assert_eq!(acks, vec![4, 8, 10]);
    }

    #[test]
    fn checksum_mismatch_aborts_never_completes() {
        let data = payload(1024 * 2);
        let checksum = file_checksum(b"some other content entirely");
        let mut rx = TransferReceiver::from_begin(
            Uuid::new_v4(),
            data.len() as u64,
            1024,
            2,
            checksum,
            16,
            u64::MAX,
        )
        .unwrap();

        assert!(matches!(
            rx.accept_chunk(0, &data[..1024]),
            ChunkOutcome::Applied
        ));
        match rx.accept_chunk(1, &data[1024..]) {
            ChunkOutcome::Abort(ControlMessage::FileError { reason, .. }) => {
                assert_eq!(reason, FileErrorReason::ChecksumMismatch);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(rx.state(), ReceiverState::Aborted);

        // Further chunks are rejected; the transfer never reports complete.
        assert!(matches!(
            rx.accept_chunk(0, &data[..1024]),
            ChunkOutcome::Rejected
        ));
        assert_ne!(rx.state(), ReceiverState::Complete);
    }

    #[test]
    fn malformed_chunks_rejected() {
        let data = payload(300);
        let (mut rx, chunks) = make(&data, 256, 16);

        // Out-of-range index.
        assert!(matches!(
            rx.accept_chunk(2, &chunks[0]),
            ChunkOutcome::Rejected
        ));
        // Wrong length for the last (short) chunk.
        assert!(matches!(
            rx.accept_chunk(1, &vec![0u8; 256]),
            ChunkOutcome::Rejected
        ));
        // Correct frames still complete the transfer.
        let _ = rx.accept_chunk(0, &chunks[0]);
        assert!(matches!(
            rx.accept_chunk(1, &chunks[1]),
            ChunkOutcome::Complete { .. }
        ));
    }

    #[test]
    fn inconsistent_geometry_rejected() {
        let max = u64::MAX;
        assert!(
            TransferReceiver::from_begin(Uuid::new_v4(), 1000, 0, 1, [0; 32], 16, max).is_none()
        );
        assert!(
            TransferReceiver::from_begin(Uuid::new_v4(), 1000, 100, 3, [0; 32], 16, max).is_none()
        );
        assert!(
            TransferReceiver::from_begin(Uuid::new_v4(), 1000, 100, 10, [0; 32], 16, max).is_some()
        );
    }

    #[test]
    fn oversize_announcement_rejected_before_allocation() {
        // Self-consistent geometry, but past the receive limit.
        assert!(TransferReceiver::from_begin(
            Uuid::new_v4(),
            100 * 1024 * 1024 * 1024,
            16 * 1024,
            6_553_600,
            [0; 32],
            16,
            256 * 1024 * 1024,
        )
        .is_none());
        // Exactly at the limit is accepted.
        assert!(
            TransferReceiver::from_begin(Uuid::new_v4(), 100, 10, 10, [0; 32], 16, 100).is_some()
        );
    }

    #[test]
    fn empty_transfer_settles_without_chunks() {
        let checksum = file_checksum(b"");
        let mut rx =
            TransferReceiver::from_begin(Uuid::new_v4(), 0, 1024, 0, checksum, 16, u64::MAX)
                .unwrap();

        match rx.settle_if_empty() {
            Some(ChunkOutcome::Complete { data, ack }) => {
                assert!(data.is_empty());
                assert!(matches!(ack, ControlMessage::FileAck { watermark: 0, .. }));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(rx.state(), ReceiverState::Complete);
        // Settling is one-shot.
        assert!(rx.settle_if_empty().is_none());
    }

    #[test]
    fn abort_discards_partial_state() {
        let data = payload(512 * 4);
        let (mut rx, chunks) = make(&data, 512, 16);
        let _ = rx.accept_chunk(0, &chunks[0]);
        rx.abort();
        assert_eq!(rx.state(), ReceiverState::Aborted);
        assert!(matches!(
            rx.accept_chunk(1, &chunks[1]),
            ChunkOutcome::Rejected
        ));
    }
}
