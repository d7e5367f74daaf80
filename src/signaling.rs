//! Signaling: the external channel that bootstraps a peer connection.
//!
//! Only two message types are carried — a session description blob and an
//! ICE candidate blob. How they travel is the collaborator's business; the
//! [`SignalingChannel`] trait is the whole contract. [`TcpSignaling`]
//! provides the simple length-prefixed-JSON-over-TCP flavor used by the
//! demo binary and integration tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{PeerlinkError, Result};

/// Upper bound on a single signaling message (descriptions with many
/// candidates stay far below this).
const MAX_SIGNAL_LEN: u32 = 1024 * 1024;

/// The two signaling message types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SignalMessage {
    /// A session description: `kind` is `offer` or `answer`, `blob` is the
    /// JSON-serialized description.
    Description { kind: String, blob: String },
    /// A trickled ICE candidate, JSON-serialized.
    Candidate { blob: String },
}

/// Abstract duplex signaling channel provided by the embedding application.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, msg: SignalMessage) -> Result<()>;
    /// Receive the next message; `None` when the peer closed the channel.
    async fn recv(&self) -> Result<Option<SignalMessage>>;
    async fn close(&self) -> Result<()>;
}

// ── TCP signaling ────────────────────────────────────────────────────────────

/// Length-prefixed JSON signaling over a TCP socket.
///
/// Wire format per message: `[u32 BE length][JSON bytes]`.
pub struct TcpSignaling {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpSignaling {
    fn from_stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Connect to a listening peer (the offerer's role in the demo).
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PeerlinkError::Signaling(format!("connect {addr}: {e}")))?;
        debug!(event = "signaling_connected", %addr, "Signaling socket connected");
        Ok(Self::from_stream(stream))
    }

    /// Accept a single inbound peer (the answerer's role in the demo).
    pub async fn accept(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PeerlinkError::Signaling(format!("bind {addr}: {e}")))?;
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| PeerlinkError::Signaling(format!("accept: {e}")))?;
        debug!(event = "signaling_accepted", %peer, "Signaling peer connected");
        Ok(Self::from_stream(stream))
    }
}

#[async_trait]
impl SignalingChannel for TcpSignaling {
    async fn send(&self, msg: SignalMessage) -> Result<()> {
        let json = serde_json::to_vec(&msg)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&(json.len() as u32).to_be_bytes())
            .await
            .map_err(|e| PeerlinkError::Signaling(format!("send: {e}")))?;
        writer
            .write_all(&json)
            .await
            .map_err(|e| PeerlinkError::Signaling(format!("send: {e}")))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<SignalMessage>> {
        let mut reader = self.reader.lock().await;
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(PeerlinkError::Signaling(format!("recv: {e}"))),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_SIGNAL_LEN {
            return Err(PeerlinkError::Signaling(format!(
                "signaling message too large: {len} bytes"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| PeerlinkError::Signaling(format!("recv: {e}")))?;
        let msg = serde_json::from_slice(&buf)?;
        Ok(Some(msg))
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_signaling_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            TcpSignaling::from_stream(stream)
        });
        let client = TcpSignaling::connect(&addr.to_string()).await.unwrap();
        let server = server.await.unwrap();

        client
            .send(SignalMessage::Description {
                kind: "offer".into(),
                blob: "{\"sdp\":\"v=0\"}".into(),
            })
            .await
            .unwrap();
        client
            .send(SignalMessage::Candidate {
                blob: "candidate:1".into(),
            })
            .await
            .unwrap();

        match server.recv().await.unwrap().unwrap() {
            SignalMessage::Description { kind, .. } => assert_eq!(kind, "offer"),
            other => panic!("unexpected message: {other:?}"),
        }
        match server.recv().await.unwrap().unwrap() {
            SignalMessage::Candidate { blob } => assert_eq!(blob, "candidate:1"),
            other => panic!("unexpected message: {other:?}"),
        }

        client.close().await.unwrap();
        assert!(server.recv().await.unwrap().is_none());
    }
}
