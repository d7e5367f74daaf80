//! Peer connection manager: negotiation over an external signaling channel,
//! trickle ICE, connection-state events, and the two data channels.
//!
//! Two logical channels are opened per session:
//! - `"control"` — ordered + fully reliable; carries text, file-control,
//!   acks, and file chunks.
//! - `"media"` — unordered, no retransmits; best-effort media-adjacent
//!   signaling.
//!
//! Trickle semantics: candidate messages may arrive before or after the
//! description exchange completes. Candidates that arrive before a remote
//! description is set are buffered and applied once it is.

pub mod channel;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{PeerlinkConfig, SCTP_MAX_MESSAGE_SIZE};
use crate::error::{PeerlinkError, Result};
use crate::protocol::Frame;
use crate::signaling::{SignalMessage, SignalingChannel};

use channel::{attach_inbound, ChannelTransport};

/// Which side of the negotiation this endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offer,
    Answer,
}

/// Connection state of one negotiated peer session.
///
/// Transitions are monotonic except `Disconnected -> Connecting`, which is
/// taken only during an explicit reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(s: RTCPeerConnectionState) -> Self {
        match s {
            RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

/// Events flowing from the connection to the session actor.
#[derive(Debug)]
pub enum ConnEvent {
    /// A decoded data-channel frame.
    Frame(Frame),
    /// The peer connection changed state.
    StateChanged(ConnectionState),
    /// The remote peer added a media track.
    TrackAdded(Arc<TrackRemote>),
}

/// A negotiated peer connection with its two data channels.
pub struct PeerConnection {
    pc: Arc<RTCPeerConnection>,
    control: ChannelTransport,
    media: ChannelTransport,
    state_rx: watch::Receiver<ConnectionState>,
    closed: AtomicBool,
    candidate_pump: tokio::task::JoinHandle<()>,
}

impl PeerConnection {
    /// Negotiate a session via the signaling channel.
    ///
    /// Fails with [`PeerlinkError::Negotiation`] when no compatible
    /// description is reached within the configured deadline, and
    /// [`PeerlinkError::Transport`] when the network path cannot be
    /// established afterwards.
    pub async fn open(
        role: Role,
        config: &PeerlinkConfig,
        signaling: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Result<Self> {
        timeout(
            config.negotiation_timeout,
            Self::negotiate(role, signaling, events),
        )
        .await
        .map_err(|_| PeerlinkError::Negotiation("negotiation deadline elapsed".into()))?
    }

    fn default_ice_servers() -> Vec<RTCIceServer> {
        vec![RTCIceServer {
            urls: vec!["stun:stun.l.google.com:19302".into()],
            ..Default::default()
        }]
    }

    async fn build_peer(events: &mpsc::UnboundedSender<ConnEvent>) -> Result<(
        Arc<RTCPeerConnection>,
        watch::Receiver<ConnectionState>,
    )> {
        let mut me = MediaEngine::default();
        me.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut me)?;

        // Raise the SCTP send limit past the 64 KB default so tuned chunk
        // sizes survive. The crate exposes no receive-side setter; the SDP
        // max-message-size attribute advertises that direction instead.
        let mut se = SettingEngine::default();
        se.set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

        let api = APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers: Self::default_ice_servers(),
                ..Default::default()
            })
            .await?,
        );

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let ev = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s| {
            let ev = ev.clone();
            let state_tx = state_tx.clone();
            Box::pin(async move {
                let state = ConnectionState::from(s);
                match state {
                    ConnectionState::Connected => {
                        info!(event = "peer_connected", "Peer connection established")
                    }
                    ConnectionState::Failed => {
                        error!(event = "peer_failed", "Peer connection failed")
                    }
                    ConnectionState::Disconnected => warn!(
                        event = "peer_disconnected",
                        "Transient disconnect (ICE may recover)"
                    ),
                    ConnectionState::Closed => {
                        info!(event = "peer_closed", "Peer connection closed")
                    }
                    _ => {}
                }
                let _ = state_tx.send(state);
                let _ = ev.send(ConnEvent::StateChanged(state));
            })
        }));

        let ev = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let ev = ev.clone();
            Box::pin(async move {
                info!(
                    event = "track_added",
                    kind = %track.kind(),
                    "Remote media track received"
                );
                let _ = ev.send(ConnEvent::TrackAdded(track));
            })
        }));

        Ok((pc, state_rx))
    }

    /// Forward locally gathered candidates to the peer as they trickle in.
    fn forward_candidates(pc: &Arc<RTCPeerConnection>, signaling: Arc<dyn SignalingChannel>) {
        pc.on_ice_candidate(Box::new(move |candidate| {
            let signaling = signaling.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!(event = "candidate_encode_failed", error = %e, "Skipping candidate");
                        return;
                    }
                };
                let blob = match serde_json::to_string(&init) {
                    Ok(blob) => blob,
                    Err(e) => {
                        warn!(event = "candidate_encode_failed", error = %e, "Skipping candidate");
                        return;
                    }
                };
                if let Err(e) = signaling.send(SignalMessage::Candidate { blob }).await {
                    warn!(event = "candidate_send_failed", error = %e, "Failed to trickle candidate");
                }
            })
        }));
    }

    /// Append `a=max-message-size` so the remote peer learns our SCTP
    /// receive capability; without the attribute it assumes the 64 KB
    /// default.
    fn inject_max_message_size(mut desc: RTCSessionDescription) -> RTCSessionDescription {
        if !desc.sdp.contains("a=max-message-size:") {
            desc.sdp
                .push_str(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}\r\n"));
        }
        desc
    }

    async fn apply_candidate(pc: &Arc<RTCPeerConnection>, blob: &str) {
        match serde_json::from_str::<RTCIceCandidateInit>(blob) {
            Ok(init) => {
                if let Err(e) = pc.add_ice_candidate(init).await {
                    warn!(event = "candidate_apply_failed", error = %e, "Failed to add candidate");
                }
            }
            Err(e) => {
                warn!(event = "candidate_decode_failed", error = %e, "Dropping candidate blob");
            }
        }
    }

    async fn negotiate(
        role: Role,
        signaling: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Result<Self> {
        let (pc, state_rx) = Self::build_peer(&events).await?;
        Self::forward_candidates(&pc, signaling.clone());

        let control = ChannelTransport::new("control");
        let media = ChannelTransport::new("media");

        match role {
            Role::Offer => {
                // The offerer creates both channels up front.
                let cdc = pc
                    .create_data_channel(
                        "control",
                        Some(RTCDataChannelInit {
                            ordered: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await?;
                attach_inbound(&cdc, events.clone());
                control.install(cdc).await;

                let mdc = pc
                    .create_data_channel(
                        "media",
                        Some(RTCDataChannelInit {
                            ordered: Some(false),
                            max_retransmits: Some(0),
                            ..Default::default()
                        }),
                    )
                    .await?;
                attach_inbound(&mdc, events.clone());
                media.install(mdc).await;

                let offer = pc.create_offer(None).await?;
                pc.set_local_description(offer.clone()).await?;
                let offer = Self::inject_max_message_size(offer);
                signaling
                    .send(SignalMessage::Description {
                        kind: "offer".into(),
                        blob: serde_json::to_string(&offer)?,
                    })
                    .await?;

                // Candidates may trickle in before the answer arrives.
                let mut pending = Vec::new();
                loop {
                    match signaling.recv().await? {
                        Some(SignalMessage::Candidate { blob }) => pending.push(blob),
                        Some(SignalMessage::Description { kind, blob }) => {
                            if kind != "answer" {
                                return Err(PeerlinkError::Negotiation(format!(
                                    "expected answer, got {kind}"
                                )));
                            }
                            let desc: RTCSessionDescription = serde_json::from_str(&blob)?;
                            pc.set_remote_description(desc).await?;
                            break;
                        }
                        None => {
                            return Err(PeerlinkError::Negotiation(
                                "signaling closed before answer".into(),
                            ))
                        }
                    }
                }
                for blob in pending {
                    Self::apply_candidate(&pc, &blob).await;
                }
            }
            Role::Answer => {
                // The answerer learns about channels from the offerer's SDP.
                let control_slot = control.slot();
                let media_slot = media.slot();
                let ev = events.clone();
                pc.on_data_channel(Box::new(move |dc| {
                    let control_slot = control_slot.clone();
                    let media_slot = media_slot.clone();
                    let ev = ev.clone();
                    Box::pin(async move {
                        attach_inbound(&dc, ev);
                        match dc.label() {
                            "control" => *control_slot.write().await = Some(dc),
                            "media" => *media_slot.write().await = Some(dc),
                            other => {
                                warn!(
                                    event = "unexpected_channel",
                                    label = %other,
                                    "Ignoring unknown data channel"
                                );
                            }
                        }
                    })
                }));

                let mut pending = Vec::new();
                let offer = loop {
                    match signaling.recv().await? {
                        Some(SignalMessage::Candidate { blob }) => pending.push(blob),
                        Some(SignalMessage::Description { kind, blob }) => {
                            if kind != "offer" {
                                return Err(PeerlinkError::Negotiation(format!(
                                    "expected offer, got {kind}"
                                )));
                            }
                            break serde_json::from_str::<RTCSessionDescription>(&blob)?;
                        }
                        None => {
                            return Err(PeerlinkError::Negotiation(
                                "signaling closed before offer".into(),
                            ))
                        }
                    }
                };
                pc.set_remote_description(offer).await?;
                for blob in pending {
                    Self::apply_candidate(&pc, &blob).await;
                }

                let answer = pc.create_answer(None).await?;
                pc.set_local_description(answer.clone()).await?;
                let answer = Self::inject_max_message_size(answer);
                signaling
                    .send(SignalMessage::Description {
                        kind: "answer".into(),
                        blob: serde_json::to_string(&answer)?,
                    })
                    .await?;
            }
        }

        // Keep applying late candidates for the life of the connection.
        let pump_pc = pc.clone();
        let pump_signaling = signaling.clone();
        let candidate_pump = tokio::spawn(async move {
            loop {
                match pump_signaling.recv().await {
                    Ok(Some(SignalMessage::Candidate { blob })) => {
                        Self::apply_candidate(&pump_pc, &blob).await;
                    }
                    Ok(Some(SignalMessage::Description { .. })) => {
                        debug!(
                            event = "late_description_ignored",
                            "Description after negotiation complete"
                        );
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });

        Ok(Self {
            pc,
            control,
            media,
            state_rx,
            closed: AtomicBool::new(false),
            candidate_pump,
        })
    }

    /// Wait for the connection (not just the description exchange) to come up.
    pub async fn wait_connected(&self, deadline: std::time::Duration) -> Result<()> {
        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                match *rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Failed => {
                        return Err(PeerlinkError::Transport(
                            "peer connection failed during setup".into(),
                        ))
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(PeerlinkError::Transport("state channel closed".into()));
                }
            }
        };
        timeout(deadline, wait)
            .await
            .map_err(|_| PeerlinkError::Negotiation("connection deadline elapsed".into()))?
    }

    /// The reliable-ordered control channel.
    pub fn control(&self) -> &ChannelTransport {
        &self.control
    }

    /// The best-effort media signaling channel.
    pub fn media(&self) -> &ChannelTransport {
        &self.media
    }

    pub(crate) fn inner(&self) -> Arc<RTCPeerConnection> {
        self.pc.clone()
    }

    /// Close the connection, releasing channels and track bindings.
    /// Idempotent: closing an already-closed connection is a no-op.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.candidate_pump.abort();
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_description_advertises_max_message_size() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_string();
        let desc = RTCSessionDescription::offer(sdp).unwrap();

        let injected = PeerConnection::inject_max_message_size(desc);
        assert!(injected
            .sdp
            .contains(&format!("a=max-message-size:{SCTP_MAX_MESSAGE_SIZE}")));

        // Already-present attribute is not duplicated.
        let again = PeerConnection::inject_max_message_size(injected);
        assert_eq!(again.sdp.matches("a=max-message-size:").count(), 1);
    }
}
