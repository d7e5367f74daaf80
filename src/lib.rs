//! peerlink: bidirectional peer-to-peer data and media sessions.
//!
//! Each session pairs a WebRTC peer connection (negotiated over a
//! caller-provided signaling channel) with a reliable chunked file transfer
//! protocol, a plain text channel, and best-effort media track relay. One
//! actor task per session serializes all outbound traffic; inbound text and
//! completed file transfers are handed to a [`session::Processor`]
//! collaborator whose replies flow back to the peer as text.
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerlink::{PeerlinkConfig, Role, Session, TcpSignaling};
//! # use async_trait::async_trait;
//! # struct Echo;
//! # #[async_trait]
//! # impl peerlink::Processor for Echo {
//! #     async fn process_text(&self, _: uuid::Uuid, t: String) -> Option<String> { Some(t) }
//! #     async fn process_file(&self, _: uuid::Uuid, _: uuid::Uuid, _: bytes::Bytes) -> Option<String> { None }
//! # }
//!
//! # async fn run() -> peerlink::Result<()> {
//! let signaling = Arc::new(TcpSignaling::accept("0.0.0.0:9400").await?);
//! let (session, mut events) = Session::connect(
//!     Role::Answer,
//!     PeerlinkConfig::default(),
//!     signaling,
//!     Arc::new(Echo),
//! )
//! .await?;
//!
//! session.send_text("hello")?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use config::PeerlinkConfig;
pub use connection::{channel::ChannelTransport, ConnectionState, Role};
pub use error::{PeerlinkError, Result};
pub use media::{FrameQueue, MediaRelay};
pub use session::{Processor, Session, SessionEvent, SessionState};
pub use signaling::{SignalMessage, SignalingChannel, TcpSignaling};
