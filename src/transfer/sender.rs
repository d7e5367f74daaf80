//! Sender side of the chunked transfer protocol.
//!
//! State machine: `Announced -> Sending -> AwaitingAck -> Complete | Aborted`.
//!
//! Flow control is a sliding window over cumulative acks: at most
//! `window_size` chunks may be outstanding past the receiver's contiguous
//! watermark. An ack timeout with no progress retransmits the unacknowledged
//! window, not the whole file. A checksum mismatch reported by the receiver
//! restarts the transfer (fresh `FileBegin`, same transfer id) until the
//! retry budget runs out, after which the transfer fails terminally.
//!
//! The machine is pure: the session actor owns the clock and the wire, and
//! drives this through `take_window` / `handle_ack` / `on_tick`.

use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PeerlinkConfig;
use crate::protocol::{ControlMessage, FileErrorReason};
use crate::transfer::chunk::file_checksum;

/// Sender-side transfer states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Created; `FileBegin` not yet sent.
    Announced,
    /// Streaming chunks within the window.
    Sending,
    /// All chunks sent at least once; waiting for the final ack.
    AwaitingAck,
    Complete,
    Aborted,
}

/// What the session actor must do after a tick or inbound control message.
#[derive(Debug)]
pub enum SenderAction {
    /// Nothing to do.
    None,
    /// Window timed out: pull `take_window` again and resend.
    Retransmit,
    /// Checksum mismatch: announce again with this `FileBegin`, then resend.
    Restart(ControlMessage),
    /// Transfer finished; all chunks acknowledged.
    Complete,
    /// Retry budget exhausted; terminal for this transfer only.
    Failed(String),
}

/// One outbound file transfer.
pub struct TransferSender {
    id: Uuid,
    data: Bytes,
    chunk_size: usize,
    chunk_count: u32,
    checksum: [u8; 32],
    window_size: u32,
    retry_budget: u32,
    state: SenderState,
    /// Next chunk index to put on the wire.
    next_index: u32,
    /// Receiver's contiguous watermark from the latest ack.
    watermark: u32,
    /// Checksum-mismatch restarts consumed.
    mismatch_retries: u32,
    /// Consecutive no-progress window timeouts; reset on ack progress.
    timeout_strikes: u32,
    last_progress: Instant,
}

impl TransferSender {
    pub fn new(id: Uuid, data: Bytes, config: &PeerlinkConfig, now: Instant) -> Self {
        let checksum = file_checksum(&data);
        let chunk_count = config.chunk_count(data.len() as u64);
        Self {
            id,
            data,
            chunk_size: config.chunk_size,
            chunk_count,
            checksum,
            window_size: config.window_size,
            retry_budget: config.retry_budget,
            state: SenderState::Announced,
            next_index: 0,
            watermark: 0,
            mismatch_retries: 0,
            timeout_strikes: 0,
            last_progress: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Chunks on the wire past the receiver's contiguous watermark.
    pub fn in_flight(&self) -> u32 {
        self.next_index.saturating_sub(self.watermark)
    }

    fn begin_message(&self) -> ControlMessage {
        ControlMessage::FileBegin {
            transfer_id: self.id,
            total_size: self.data.len() as u64,
            chunk_size: self.chunk_size as u32,
            chunk_count: self.chunk_count,
            checksum: self.checksum,
        }
    }

    /// Announce the transfer. `Announced -> Sending`.
    ///
    /// A zero-byte payload has no chunks to stream and nothing to await:
    /// the announce alone settles it as `Complete`.
    pub fn begin(&mut self) -> ControlMessage {
        debug_assert_eq!(self.state, SenderState::Announced);
        self.state = if self.chunk_count == 0 {
            SenderState::Complete
        } else {
            SenderState::Sending
        };
        info!(
            event = "transfer_begin",
            transfer_id = %self.id,
            bytes = self.data.len(),
            chunks = self.chunk_count,
            "Announcing file transfer"
        );
        self.begin_message()
    }

    fn chunk_at(&self, index: u32) -> Bytes {
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        self.data.slice(start..end)
    }

    /// Pull the chunks the window currently permits, in index order.
    ///
    /// Advances `next_index`; transitions to `AwaitingAck` once every index
    /// has been put on the wire at least once. Never yields more than
    /// `window_size` outstanding chunks.
    pub fn take_window(&mut self) -> Vec<(u32, Bytes)> {
        if self.state != SenderState::Sending {
            return Vec::new();
        }
        let mut out = Vec::new();
        while self.next_index < self.chunk_count && self.in_flight() < self.window_size {
            out.push((self.next_index, self.chunk_at(self.next_index)));
            self.next_index += 1;
        }
        if self.next_index == self.chunk_count {
            self.state = SenderState::AwaitingAck;
        }
        out
    }

    /// Apply a cumulative ack from the receiver.
    pub fn handle_ack(&mut self, watermark: u32, now: Instant) -> SenderAction {
        if matches!(self.state, SenderState::Complete | SenderState::Aborted) {
            return SenderAction::None;
        }
        if watermark > self.watermark {
            self.watermark = watermark.min(self.chunk_count);
            self.timeout_strikes = 0;
            self.last_progress = now;
        }
        if self.watermark == self.chunk_count {
            self.state = SenderState::Complete;
            info!(
                event = "transfer_sent",
                transfer_id = %self.id,
                chunks = self.chunk_count,
                "All chunks acknowledged"
            );
            return SenderAction::Complete;
        }
        // A window that was fully in flight may have room again.
        if self.state == SenderState::AwaitingAck && self.next_index < self.chunk_count {
            self.state = SenderState::Sending;
        }
        SenderAction::None
    }

    /// Apply a `FileError` from the receiver.
    pub fn handle_error(&mut self, reason: FileErrorReason, now: Instant) -> SenderAction {
        match reason {
            FileErrorReason::Aborted => {
                self.state = SenderState::Aborted;
                SenderAction::Failed("aborted by peer".into())
            }
            FileErrorReason::ChecksumMismatch => {
                self.mismatch_retries += 1;
                if self.mismatch_retries > self.retry_budget {
                    self.state = SenderState::Aborted;
                    warn!(
                        event = "transfer_retry_budget_exhausted",
                        transfer_id = %self.id,
                        retries = self.mismatch_retries - 1,
                        "Giving up after repeated checksum mismatches"
                    );
                    return SenderAction::Failed("checksum mismatch, retry budget exhausted".into());
                }
                // The receiver discarded its buffer on abort, so the restart
                // streams from the top of its (now empty) contiguous set.
                self.watermark = 0;
                self.next_index = 0;
                self.timeout_strikes = 0;
                self.state = SenderState::Sending;
                self.last_progress = now;
                info!(
                    event = "transfer_restart",
                    transfer_id = %self.id,
                    attempt = self.mismatch_retries,
                    "Restarting transfer after checksum mismatch"
                );
                SenderAction::Restart(self.begin_message())
            }
        }
    }

    /// Housekeeping tick: detect a stalled window.
    ///
    /// With chunks in flight and no ack progress for `ack_timeout`, the
    /// unacknowledged window is rewound for retransmission. Consecutive
    /// stalls beyond the retry budget fail the transfer.
    pub fn on_tick(&mut self, now: Instant, ack_timeout: std::time::Duration) -> SenderAction {
        if !matches!(self.state, SenderState::Sending | SenderState::AwaitingAck) {
            return SenderAction::None;
        }
        if self.in_flight() == 0 || now.duration_since(self.last_progress) < ack_timeout {
            return SenderAction::None;
        }
        self.timeout_strikes += 1;
        if self.timeout_strikes > self.retry_budget {
            self.state = SenderState::Aborted;
            warn!(
                event = "transfer_ack_timeout",
                transfer_id = %self.id,
                strikes = self.timeout_strikes - 1,
                "No ack progress, giving up"
            );
            return SenderAction::Failed("ack timeout, retry budget exhausted".into());
        }
        debug!(
            event = "window_retransmit",
            transfer_id = %self.id,
            from = self.watermark,
            to = self.next_index,
            "Retransmitting unacknowledged window"
        );
        self.next_index = self.watermark;
        self.state = SenderState::Sending;
        self.last_progress = now;
        SenderAction::Retransmit
    }

    /// Abort locally (session close). No further retries.
    pub fn abort(&mut self) {
        if !matches!(self.state, SenderState::Complete | SenderState::Aborted) {
            self.state = SenderState::Aborted;
        }
    }

    /// Fraction of the transfer acknowledged, for progress events.
    pub fn acked_chunks(&self) -> u32 {
        self.watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(chunk_size: usize, window: u32) -> PeerlinkConfig {
        PeerlinkConfig {
            chunk_size,
            window_size: window,
            ack_batch: 4,
            retry_budget: 3,
            ..Default::default()
        }
    }

    fn sender(bytes: usize, chunk_size: usize, window: u32) -> TransferSender {
        let data = Bytes::from((0..bytes).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        TransferSender::new(Uuid::new_v4(), data, &config(chunk_size, window), Instant::now())
    }

    #[test]
    fn window_never_exceeds_configured_width() {
        let mut tx = sender(100 * 64, 64, 8);
        assert_eq!(tx.chunk_count(), 100);
        tx.begin();

        let first = tx.take_window();
        assert_eq!(first.len(), 8);
        assert_eq!(tx.in_flight(), 8);

        // No ack: the window is closed.
        assert!(tx.take_window().is_empty());
        assert_eq!(tx.in_flight(), 8);

        // Ack 4 chunks: exactly 4 more are released.
        tx.handle_ack(4, Instant::now());
        let more = tx.take_window();
        assert_eq!(more.len(), 4);
        assert_eq!(more[0].0, 8);
        assert!(tx.in_flight() <= 8);
    }

    #[test]
    fn completes_when_all_acked() {
        let mut tx = sender(10 * 16, 16, 32);
        tx.begin();
        let chunks = tx.take_window();
        assert_eq!(chunks.len(), 10);
        assert_eq!(tx.state(), SenderState::AwaitingAck);

        assert!(matches!(
            tx.handle_ack(10, Instant::now()),
            SenderAction::Complete
        ));
        assert_eq!(tx.state(), SenderState::Complete);
    }

    #[test]
    fn last_chunk_is_short() {
        let mut tx = sender(100, 64, 32);
        assert_eq!(tx.chunk_count(), 2);
        tx.begin();
        let chunks = tx.take_window();
        assert_eq!(chunks[0].1.len(), 64);
        assert_eq!(chunks[1].1.len(), 36);
    }

    #[test]
    fn ack_timeout_retransmits_unacked_window_only() {
        let start = Instant::now();
        let mut tx = sender(20 * 8, 8, 8);
        tx.begin();
        let _ = tx.take_window();
        tx.handle_ack(5, start);

        // Past the timeout with 3 chunks in flight unacked.
        let later = start + Duration::from_secs(60);
        assert!(matches!(
            tx.on_tick(later, Duration::from_secs(5)),
            SenderAction::Retransmit
        ));
        let resent = tx.take_window();
        // Rewound to the watermark, not to zero.
        assert_eq!(resent[0].0, 5);
        assert!(resent.iter().all(|(i, _)| *i >= 5));
    }

    #[test]
    fn tick_without_stall_is_noop() {
        let start = Instant::now();
        let mut tx = sender(20 * 8, 8, 8);
        tx.begin();
        let _ = tx.take_window();
        assert!(matches!(
            tx.on_tick(start + Duration::from_millis(10), Duration::from_secs(5)),
            SenderAction::None
        ));
    }

    #[test]
    fn checksum_mismatch_restarts_until_budget_exhausted() {
        let now = Instant::now();
        let mut tx = sender(4 * 32, 32, 32);
        tx.begin();
        let _ = tx.take_window();

        for attempt in 1..=3 {
            match tx.handle_error(FileErrorReason::ChecksumMismatch, now) {
                SenderAction::Restart(ControlMessage::FileBegin { chunk_count, .. }) => {
                    assert_eq!(chunk_count, 4);
                }
                other => panic!("attempt {attempt}: unexpected action {other:?}"),
            }
            assert_eq!(tx.state(), SenderState::Sending);
            // Restart streams the whole file again.
            let chunks = tx.take_window();
            assert_eq!(chunks.len(), 4);
            assert_eq!(chunks[0].0, 0);
        }

        // Fourth mismatch exceeds the budget of 3.
        assert!(matches!(
            tx.handle_error(FileErrorReason::ChecksumMismatch, now),
            SenderAction::Failed(_)
        ));
        assert_eq!(tx.state(), SenderState::Aborted);
    }

    #[test]
    fn empty_payload_settles_at_announce() {
        let start = Instant::now();
        let mut tx = sender(0, 32, 8);
        assert_eq!(tx.chunk_count(), 0);

        let begin = tx.begin();
        assert!(matches!(
            begin,
            ControlMessage::FileBegin {
                total_size: 0,
                chunk_count: 0,
                ..
            }
        ));
        assert_eq!(tx.state(), SenderState::Complete);
        assert!(tx.take_window().is_empty());

        // Nothing in flight, nothing to stall on, however long we wait.
        assert!(matches!(
            tx.on_tick(start + Duration::from_secs(3600), Duration::from_secs(5)),
            SenderAction::None
        ));
        assert_eq!(tx.state(), SenderState::Complete);
    }

    #[test]
    fn peer_abort_is_terminal_without_retry() {
        let now = Instant::now();
        let mut tx = sender(64, 32, 32);
        tx.begin();
        assert!(matches!(
            tx.handle_error(FileErrorReason::Aborted, now),
            SenderAction::Failed(_)
        ));
        assert_eq!(tx.state(), SenderState::Aborted);
    }

    #[test]
    fn local_abort_from_any_state() {
        let mut tx = sender(64, 32, 32);
        tx.abort();
        assert_eq!(tx.state(), SenderState::Aborted);

        let mut tx = sender(64, 32, 32);
        tx.begin();
        let _ = tx.take_window();
        tx.abort();
        assert_eq!(tx.state(), SenderState::Aborted);
        // Acks after abort are ignored.
        assert!(matches!(
            tx.handle_ack(2, Instant::now()),
            SenderAction::None
        ));
        assert_eq!(tx.state(), SenderState::Aborted);
    }
}
