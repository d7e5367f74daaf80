//! Data channel transport: framed send/receive over one `RTCDataChannel`.
//!
//! The transport surfaces backpressure instead of hiding it: sending on a
//! channel that is not open fails with `ChannelNotOpen` and nothing is
//! queued on the caller's behalf. Inbound messages are decoded and handed
//! to the session actor in arrival order.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{PeerlinkError, Result};
use crate::protocol::decode_frame;

use super::ConnEvent;

/// Shared slot for a data channel that may not exist yet (the answerer only
/// learns about channels from `on_data_channel`).
pub(crate) type ChannelSlot = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// One logical channel of the transport.
#[derive(Clone)]
pub struct ChannelTransport {
    label: &'static str,
    slot: ChannelSlot,
}

impl ChannelTransport {
    pub(crate) fn new(label: &'static str) -> Self {
        Self {
            label,
            slot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn slot(&self) -> ChannelSlot {
        self.slot.clone()
    }

    pub(crate) async fn install(&self, dc: Arc<RTCDataChannel>) {
        *self.slot.write().await = Some(dc);
    }

    /// Whether the underlying channel exists and is open.
    pub async fn is_open(&self) -> bool {
        match self.slot.read().await.as_ref() {
            Some(dc) => dc.ready_state() == RTCDataChannelState::Open,
            None => false,
        }
    }

    /// Send one framed message.
    ///
    /// Fails with [`PeerlinkError::ChannelNotOpen`] when the channel is
    /// missing or not in the `Open` state; the caller may defer and retry.
    pub async fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let guard = self.slot.read().await;
        let dc = guard.as_ref().ok_or_else(|| PeerlinkError::ChannelNotOpen {
            label: self.label.to_string(),
            state: "missing".to_string(),
        })?;
        let state = dc.ready_state();
        if state != RTCDataChannelState::Open {
            warn!(
                event = "send_channel_not_open",
                channel = self.label,
                ?state,
                "Attempted send on non-open data channel"
            );
            return Err(PeerlinkError::ChannelNotOpen {
                label: self.label.to_string(),
                state: format!("{state:?}"),
            });
        }
        dc.send(&Bytes::from(frame)).await?;
        Ok(())
    }

    /// Wait until the channel exists and reports `Open`.
    pub async fn wait_open(&self, deadline: Duration) -> Result<()> {
        let dc = {
            let start = std::time::Instant::now();
            loop {
                if let Some(dc) = self.slot.read().await.clone() {
                    break dc;
                }
                if start.elapsed() > deadline {
                    return Err(PeerlinkError::Transport(format!(
                        "data channel '{}' not created within timeout",
                        self.label
                    )));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        match dc.ready_state() {
            RTCDataChannelState::Open => return Ok(()),
            RTCDataChannelState::Closed => {
                return Err(PeerlinkError::Transport(format!(
                    "data channel '{}' is permanently closed",
                    self.label
                )))
            }
            _ => {}
        }

        let (tx, mut rx) = mpsc::channel(1);
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(()).await;
            })
        }));
        // The handler may have been registered after the transition.
        if dc.ready_state() == RTCDataChannelState::Open {
            return Ok(());
        }
        match timeout(deadline, rx.recv()).await {
            Ok(_) => Ok(()),
            Err(_) => match dc.ready_state() {
                RTCDataChannelState::Open => Ok(()),
                other => Err(PeerlinkError::Transport(format!(
                    "data channel '{}' open timeout (state: {other:?})",
                    self.label
                ))),
            },
        }
    }
}

/// Wire a channel's inbound messages into the session actor's event queue.
///
/// Decode failures are logged and dropped; the session continues.
pub(crate) fn attach_inbound(dc: &Arc<RTCDataChannel>, events: mpsc::UnboundedSender<ConnEvent>) {
    let label = dc.label().to_string();
    dc.on_message(Box::new(move |msg| {
        let events = events.clone();
        let label = label.clone();
        Box::pin(async move {
            match decode_frame(&msg.data) {
                Ok(frame) => {
                    let _ = events.send(ConnEvent::Frame(frame));
                }
                Err(e) => {
                    warn!(
                        event = "frame_decode_failed",
                        channel = %label,
                        error = %e,
                        bytes = msg.data.len(),
                        "Dropping undecodable frame"
                    );
                }
            }
        })
    }));

    let label = dc.label().to_string();
    dc.on_close(Box::new(move || {
        let label = label.clone();
        Box::pin(async move {
            debug!(event = "channel_closed", channel = %label, "Data channel closed");
        })
    }));
}
