//! Constructor-time configuration and tunable constants.
//!
//! Everything an embedding application can tune lives in [`PeerlinkConfig`];
//! wire-format constants (frame tag bytes) stay in the `protocol` module.

use std::time::Duration;

use crate::error::{PeerlinkError, Result};
use crate::protocol::CHUNK_HEADER_LEN;

// ── Defaults ─────────────────────────────────────────────────────────────────

/// Default chunk size in bytes (16 KiB).
///
/// Sized to stay comfortably under the 64 KB SCTP message limit that
/// webrtc-rs applies on the receive side, leaving headroom for the
/// 21-byte chunk frame header.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Default sliding-window width: maximum unacknowledged chunks in flight.
pub const DEFAULT_WINDOW_SIZE: u32 = 32;

/// Default ack batch: the receiver acknowledges after every N chunks.
pub const DEFAULT_ACK_BATCH: u32 = 16;

/// Default retry budget per transfer (checksum-mismatch restarts and
/// consecutive no-progress window timeouts both draw from this budget).
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Default deadline for the whole signaling negotiation.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout waiting for the data channels to open after negotiation.
pub const DEFAULT_CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(15);

/// Default ack timeout: a sender with in-flight chunks and no ack progress
/// for this long retransmits its unacknowledged window.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default depth of the outbound media frame queue (drop-oldest on overflow).
pub const DEFAULT_MEDIA_QUEUE_DEPTH: usize = 30;

/// Default cap on an announced inbound transfer's total size. The receiver
/// preallocates its reassembly buffer, so the announced size cannot be
/// trusted unboundedly.
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 256 * 1024 * 1024;

/// SCTP maximum message size raised via the `SettingEngine` and advertised
/// through the SDP `a=max-message-size` attribute. Every chunk frame
/// (chunk plus its 21-byte header) must fit under this.
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Interval of the session actor's housekeeping tick (ack timeout checks).
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

// ── Config ───────────────────────────────────────────────────────────────────

/// Per-session configuration, fixed at construction time.
#[derive(Debug, Clone)]
pub struct PeerlinkConfig {
    /// File chunk size in bytes. Must stay under the transport's maximum
    /// message size.
    pub chunk_size: usize,
    /// Maximum unacknowledged chunks in flight per transfer.
    pub window_size: u32,
    /// Receiver acknowledges after every this many chunks.
    pub ack_batch: u32,
    /// Attempts per transfer before it is surfaced as failed.
    pub retry_budget: u32,
    /// Deadline for reaching a compatible session description.
    pub negotiation_timeout: Duration,
    /// Timeout waiting for the data channels to open.
    pub channel_open_timeout: Duration,
    /// No-ack-progress timeout that triggers window retransmission.
    pub ack_timeout: Duration,
    /// Largest inbound transfer size accepted; bigger announcements are
    /// rejected before any buffer is allocated.
    pub max_transfer_size: u64,
    /// Whether a transient disconnect triggers a reconnect attempt
    /// (enables the `Disconnected -> Connecting` recovery edge).
    pub reconnect: bool,
    /// Outbound media frame queue depth.
    pub media_queue_depth: usize,
}

impl Default for PeerlinkConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            window_size: DEFAULT_WINDOW_SIZE,
            ack_batch: DEFAULT_ACK_BATCH,
            retry_budget: DEFAULT_RETRY_BUDGET,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            channel_open_timeout: DEFAULT_CHANNEL_OPEN_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            reconnect: false,
            media_queue_depth: DEFAULT_MEDIA_QUEUE_DEPTH,
        }
    }
}

impl PeerlinkConfig {
    /// Number of chunks a file of `total_size` bytes splits into.
    pub fn chunk_count(&self, total_size: u64) -> u32 {
        total_size.div_ceil(self.chunk_size as u64) as u32
    }

    /// Reject tunings the transport cannot carry.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(PeerlinkError::Config("chunk_size must be nonzero".into()));
        }
        if self.chunk_size + CHUNK_HEADER_LEN > SCTP_MAX_MESSAGE_SIZE as usize {
            return Err(PeerlinkError::Config(format!(
                "chunk_size {} plus frame header exceeds the {} byte SCTP message limit",
                self.chunk_size, SCTP_MAX_MESSAGE_SIZE
            )));
        }
        if self.window_size == 0 {
            return Err(PeerlinkError::Config("window_size must be nonzero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        let cfg = PeerlinkConfig {
            chunk_size: 4096,
            ..Default::default()
        };
        assert_eq!(cfg.chunk_count(0), 0);
        assert_eq!(cfg.chunk_count(1), 1);
        assert_eq!(cfg.chunk_count(4096), 1);
        assert_eq!(cfg.chunk_count(4097), 2);
        assert_eq!(cfg.chunk_count(32768), 8);
    }

    #[test]
    fn chunk_size_validated_against_transport_limit() {
        assert!(PeerlinkConfig::default().validate().is_ok());

        let oversize = PeerlinkConfig {
            chunk_size: 2 * 1024 * 1024,
            ..Default::default()
        };
        assert!(oversize.validate().is_err());

        // The header must fit too: exactly at the limit is rejected.
        let at_limit = PeerlinkConfig {
            chunk_size: SCTP_MAX_MESSAGE_SIZE as usize,
            ..Default::default()
        };
        assert!(at_limit.validate().is_err());

        let under_limit = PeerlinkConfig {
            chunk_size: SCTP_MAX_MESSAGE_SIZE as usize - 32,
            ..Default::default()
        };
        assert!(under_limit.validate().is_ok());

        let zero = PeerlinkConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
