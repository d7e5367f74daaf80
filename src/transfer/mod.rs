//! Chunked file transfer: index-addressed chunks, sliding-window flow
//! control, cumulative acks, and SHA3-256 verification on reassembly.

pub mod chunk;
pub mod receiver;
pub mod sender;

pub use chunk::{file_checksum, ChunkBitmap};
pub use receiver::{ChunkOutcome, ReceiverState, TransferReceiver};
pub use sender::{SenderAction, SenderState, TransferSender};
