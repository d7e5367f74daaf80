//! Wire protocol: control messages and binary framing.
//!
//! All data-channel traffic uses a compact binary envelope:
//!
//!   [1 byte: frame_type] [N bytes: payload]
//!
//! Frame types:
//!   0x01 = Control (JSON-encoded [`ControlMessage`])
//!   0x02 = Chunk   (binary: 16 bytes transfer_id + 4 bytes index BE + raw data)
//!
//! Control messages ride the reliable ordered channel, so begin/ack/error for
//! one transfer are processed in send order. Chunk frames are addressed by
//! (transfer_id, index) and tolerate any arrival order: the receiver
//! demultiplexes by transfer id, never by position in the stream.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PeerlinkError, Result};

/// Frame type marker for control messages.
pub(crate) const FRAME_CONTROL: u8 = 0x01;

/// Frame type marker for binary chunk data.
pub(crate) const FRAME_CHUNK: u8 = 0x02;

/// Chunk frame header length: tag + transfer uuid + index.
pub(crate) const CHUNK_HEADER_LEN: usize = 1 + 16 + 4;

// ── Control messages ─────────────────────────────────────────────────────────

/// Reason carried by a [`ControlMessage::FileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileErrorReason {
    /// Reassembled bytes did not match the announced checksum.
    ChecksumMismatch,
    /// The peer aborted the transfer (session close, cancellation).
    Aborted,
}

/// Control messages, JSON-serialized and sent as `FRAME_CONTROL` frames on
/// the reliable ordered channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Plain text message for the application's text handler.
    Text { body: String },

    /// Announces a file transfer before its chunks.
    FileBegin {
        transfer_id: Uuid,
        total_size: u64,
        chunk_size: u32,
        chunk_count: u32,
        /// SHA3-256 over the complete file.
        checksum: [u8; 32],
    },

    /// Cumulative acknowledgment from the receiver.
    FileAck {
        transfer_id: Uuid,
        /// Count of contiguous chunks received from index 0 (one past the
        /// highest contiguous index; 0 = nothing contiguous yet).
        watermark: u32,
    },

    /// Transfer-fatal error from either side.
    FileError {
        transfer_id: Uuid,
        reason: FileErrorReason,
    },

    /// Reserved for future media signaling (renegotiation, keyframe hints).
    MediaControl { payload: Vec<u8> },
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// A decoded data-channel frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Control(ControlMessage),
    Chunk {
        transfer_id: Uuid,
        index: u32,
        data: Vec<u8>,
    },
}

/// Encode a control frame: `[0x01][json bytes]`.
pub fn encode_control_frame(msg: &ControlMessage) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    let mut buf = Vec::with_capacity(1 + json.len());
    buf.put_u8(FRAME_CONTROL);
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Encode a binary chunk frame: `[0x02][16 bytes uuid][4 bytes index BE][payload]`.
pub fn encode_chunk_frame(transfer_id: Uuid, index: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(CHUNK_HEADER_LEN + payload.len());
    buf.put_u8(FRAME_CHUNK);
    buf.extend_from_slice(transfer_id.as_bytes());
    buf.put_u32(index);
    buf.extend_from_slice(payload);
    buf
}

/// Decode a raw data-channel message into a [`Frame`].
///
/// Decode failures are per-frame: the caller logs and drops the frame, the
/// session continues.
pub fn decode_frame(raw: &[u8]) -> Result<Frame> {
    let (&tag, payload) = raw
        .split_first()
        .ok_or_else(|| PeerlinkError::Transport("empty frame".into()))?;

    match tag {
        FRAME_CONTROL => {
            let msg: ControlMessage = serde_json::from_slice(payload)?;
            Ok(Frame::Control(msg))
        }
        FRAME_CHUNK => {
            if payload.len() < 20 {
                return Err(PeerlinkError::Transport(format!(
                    "chunk frame too short: {} bytes",
                    raw.len()
                )));
            }
            let transfer_id = Uuid::from_slice(&payload[..16])
                .map_err(|e| PeerlinkError::Transport(format!("bad transfer id: {e}")))?;
            let index = u32::from_be_bytes(payload[16..20].try_into().unwrap());
            Ok(Frame::Chunk {
                transfer_id,
                index,
                data: payload[20..].to_vec(),
            })
        }
        other => Err(PeerlinkError::Transport(format!(
            "unknown frame type: 0x{other:02x}"
        ))),
    }
}
