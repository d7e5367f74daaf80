//! Error taxonomy.
//!
//! Propagation policy: per-session errors never cross sessions, and
//! per-transfer errors never abort the owning session or sibling transfers.
//! Terminal errors always reach the caller through an explicit event or
//! `Result`; nothing is silently swallowed.

use thiserror::Error;
use uuid::Uuid;

/// All failure modes surfaced by this crate.
#[derive(Debug, Error)]
pub enum PeerlinkError {
    /// Rejected constructor-time configuration (e.g. a chunk size the
    /// transport cannot carry).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// No viable session was negotiated within the configured deadline.
    /// Fatal to this connection attempt; the caller may retry.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// The underlying network path could not be established or was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// A send was attempted on a data channel that is not open. The caller
    /// may defer and retry once the channel opens; the transport itself
    /// never queues on its behalf.
    #[error("data channel '{label}' not open (state: {state})")]
    ChannelNotOpen { label: String, state: String },

    /// Reassembled bytes did not match the announced checksum. Triggers a
    /// bounded retry of the transfer.
    #[error("checksum mismatch for transfer {0}")]
    ChecksumMismatch(Uuid),

    /// The transfer's retry budget is exhausted. Terminal for this transfer
    /// only; the session and other transfers are unaffected.
    #[error("transfer {0} failed: {1}")]
    TransferFailed(Uuid, String),

    /// The external signaling channel failed.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The session is closed or closing; no further operations accepted.
    #[error("session closed")]
    Closed,

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type Result<T, E = PeerlinkError> = std::result::Result<T, E>;
