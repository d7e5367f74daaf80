//! Session coordinator: the top-level state machine and dispatch loop.
//!
//! One actor task per session serializes every outbound frame, so text,
//! file-control, and chunk messages from independently-triggered operations
//! leave the wire in one well-defined order. Cross-session state is fully
//! independent; nothing here is shared between sessions.
//!
//! The pure dispatch core ([`SessionCore`]) owns the transfer tables and the
//! coordinator state machine and is driven entirely through explicit inputs
//! (frames, commands, ticks), which keeps the protocol testable without a
//! network. The actor wraps it with the peer connection, the clock, and the
//! external processor collaborator.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{PeerlinkConfig, TICK_INTERVAL};
use crate::connection::{ConnEvent, ConnectionState, PeerConnection, Role};
use crate::error::{PeerlinkError, Result};
use crate::media::MediaRelay;
use crate::protocol::{
    encode_chunk_frame, encode_control_frame, ControlMessage, FileErrorReason, Frame,
};
use crate::signaling::SignalingChannel;
use crate::transfer::{
    ChunkOutcome, SenderAction, SenderState, TransferReceiver, TransferSender,
};

// ── External collaborator ────────────────────────────────────────────────────

/// Downstream text/file processing collaborator (the LLM seam).
///
/// Invoked off the dispatch path: latency here never blocks the session's
/// event loop. Must be safe to call with overlapping sessions.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle an inbound text message; a returned string is sent back to
    /// the peer as a text message.
    async fn process_text(&self, session_id: Uuid, text: String) -> Option<String>;

    /// Handle a completed inbound file transfer; a returned string is sent
    /// back to the peer as a text message. Called exactly once per
    /// completed transfer.
    async fn process_file(&self, session_id: Uuid, transfer_id: Uuid, data: Bytes)
        -> Option<String>;
}

// ── States and events ────────────────────────────────────────────────────────

/// Coordinator states. `Failed` is a terminal sink reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Events surfaced to the embedding application. Terminal outcomes are
/// always delivered; nothing is silently swallowed.
#[derive(Debug)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Text from the peer (also dispatched to the processor).
    TextReceived(String),
    /// Outbound transfer fully acknowledged by the peer.
    TransferSent { transfer_id: Uuid },
    /// Inbound transfer reassembled and checksum-verified.
    TransferReceived { transfer_id: Uuid, data: Bytes },
    /// Transfer failed terminally; the session and sibling transfers
    /// are unaffected.
    TransferFailed { transfer_id: Uuid, reason: String },
    TransferProgress {
        transfer_id: Uuid,
        done_chunks: u32,
        total_chunks: u32,
    },
    /// The remote peer added a media track; hand it to a render collaborator.
    TrackAdded(Arc<webrtc::track::track_remote::TrackRemote>),
    Error(String),
}

/// Commands accepted by the session actor.
enum Command {
    SendText(String),
    SendData { transfer_id: Uuid, data: Bytes },
    Close(oneshot::Sender<()>),
}

// ── Pure dispatch core ───────────────────────────────────────────────────────

/// Side effects requested by the dispatch core, applied by the actor.
#[derive(Debug)]
pub(crate) enum Action {
    Control(ControlMessage),
    Chunk {
        transfer_id: Uuid,
        index: u32,
        data: Bytes,
    },
    Event(SessionEvent),
    ProcessText(String),
    ProcessFile { transfer_id: Uuid, data: Bytes },
}

/// Coordinator state machine plus per-session transfer tables.
pub(crate) struct SessionCore {
    id: Uuid,
    config: PeerlinkConfig,
    state: SessionState,
    senders: HashMap<Uuid, TransferSender>,
    receivers: HashMap<Uuid, TransferReceiver>,
}

impl SessionCore {
    pub(crate) fn new(id: Uuid, config: PeerlinkConfig) -> Self {
        Self {
            id,
            config,
            state: SessionState::Idle,
            senders: HashMap::new(),
            receivers: HashMap::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    /// Transition the coordinator state; terminal states are sinks.
    pub(crate) fn set_state(&mut self, next: SessionState, out: &mut Vec<Action>) {
        if self.state == next || self.state.is_terminal() {
            return;
        }
        debug!(
            event = "session_state",
            session_id = %self.id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
        out.push(Action::Event(SessionEvent::StateChanged(next)));
    }

    /// Count of transfers still in flight (either direction).
    pub(crate) fn active_transfers(&self) -> usize {
        self.senders.len() + self.receivers.len()
    }

    /// Start an outbound transfer: announce it and open the first window.
    pub(crate) fn start_transfer(
        &mut self,
        transfer_id: Uuid,
        data: Bytes,
        now: Instant,
    ) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state != SessionState::Connected {
            out.push(Action::Event(SessionEvent::TransferFailed {
                transfer_id,
                reason: format!("session not connected (state: {:?})", self.state),
            }));
            return out;
        }
        let mut sender = TransferSender::new(transfer_id, data, &self.config, now);
        out.push(Action::Control(sender.begin()));
        Self::drain_window(&mut sender, &mut out);
        // An empty payload settles at the announce; never park it in the
        // table waiting for acks that carry nothing.
        if matches!(sender.state(), SenderState::Complete) {
            out.push(Action::Event(SessionEvent::TransferSent { transfer_id }));
        } else {
            self.senders.insert(transfer_id, sender);
        }
        out
    }

    fn drain_window(sender: &mut TransferSender, out: &mut Vec<Action>) {
        for (index, data) in sender.take_window() {
            out.push(Action::Chunk {
                transfer_id: sender.id(),
                index,
                data,
            });
        }
    }

    /// Route one inbound frame by kind.
    pub(crate) fn handle_frame(&mut self, frame: Frame, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if matches!(self.state, SessionState::Closing) || self.state.is_terminal() {
            return out;
        }
        match frame {
            Frame::Control(msg) => self.handle_control(msg, now, &mut out),
            Frame::Chunk {
                transfer_id,
                index,
                data,
            } => self.handle_chunk(transfer_id, index, &data, &mut out),
        }
        out
    }

    fn handle_control(&mut self, msg: ControlMessage, now: Instant, out: &mut Vec<Action>) {
        match msg {
            ControlMessage::Text { body } => {
                out.push(Action::Event(SessionEvent::TextReceived(body.clone())));
                out.push(Action::ProcessText(body));
            }
            ControlMessage::FileBegin {
                transfer_id,
                total_size,
                chunk_size,
                chunk_count,
                checksum,
            } => {
                // A begin for a known id is a restart: the previous attempt
                // (if any) is discarded.
                match TransferReceiver::from_begin(
                    transfer_id,
                    total_size,
                    chunk_size,
                    chunk_count,
                    checksum,
                    self.config.ack_batch,
                    self.config.max_transfer_size,
                ) {
                    Some(mut receiver) => {
                        let settled = receiver.settle_if_empty();
                        self.receivers.insert(transfer_id, receiver);
                        if let Some(outcome) = settled {
                            self.apply_chunk_outcome(transfer_id, outcome, out);
                        }
                    }
                    None => {
                        out.push(Action::Control(ControlMessage::FileError {
                            transfer_id,
                            reason: FileErrorReason::Aborted,
                        }));
                    }
                }
            }
            ControlMessage::FileAck {
                transfer_id,
                watermark,
            } => {
                let Some(sender) = self.senders.get_mut(&transfer_id) else {
                    debug!(
                        event = "ack_unknown_transfer",
                        transfer_id = %transfer_id,
                        "Ack for unknown transfer"
                    );
                    return;
                };
                match sender.handle_ack(watermark, now) {
                    SenderAction::Complete => {
                        out.push(Action::Event(SessionEvent::TransferSent { transfer_id }));
                        self.senders.remove(&transfer_id);
                    }
                    _ => {
                        out.push(Action::Event(SessionEvent::TransferProgress {
                            transfer_id,
                            done_chunks: sender.acked_chunks(),
                            total_chunks: sender.chunk_count(),
                        }));
                        Self::drain_window(sender, out);
                    }
                }
            }
            ControlMessage::FileError {
                transfer_id,
                reason,
            } => {
                let Some(sender) = self.senders.get_mut(&transfer_id) else {
                    // The error may target one of our receivers (peer abort).
                    if let Some(receiver) = self.receivers.get_mut(&transfer_id) {
                        receiver.abort();
                        self.receivers.remove(&transfer_id);
                        out.push(Action::Event(SessionEvent::TransferFailed {
                            transfer_id,
                            reason: "aborted by peer".into(),
                        }));
                    }
                    return;
                };
                match sender.handle_error(reason, now) {
                    SenderAction::Restart(begin) => {
                        out.push(Action::Control(begin));
                        Self::drain_window(sender, out);
                    }
                    SenderAction::Failed(reason) => {
                        out.push(Action::Event(SessionEvent::TransferFailed {
                            transfer_id,
                            reason,
                        }));
                        self.senders.remove(&transfer_id);
                    }
                    _ => {}
                }
            }
            ControlMessage::MediaControl { .. } => {
                debug!(event = "media_control_ignored", "Reserved media-control frame");
            }
        }
    }

    fn handle_chunk(&mut self, transfer_id: Uuid, index: u32, data: &[u8], out: &mut Vec<Action>) {
        let Some(receiver) = self.receivers.get_mut(&transfer_id) else {
            debug!(
                event = "chunk_unknown_transfer",
                transfer_id = %transfer_id,
                index,
                "Chunk for unknown transfer"
            );
            return;
        };
        let outcome = receiver.accept_chunk(index, data);
        self.apply_chunk_outcome(transfer_id, outcome, out);
    }

    /// Translate a receiver outcome into wire/event actions and retire the
    /// receiver entry on the terminal outcomes.
    fn apply_chunk_outcome(&mut self, transfer_id: Uuid, outcome: ChunkOutcome, out: &mut Vec<Action>) {
        match outcome {
            ChunkOutcome::Applied | ChunkOutcome::Duplicate | ChunkOutcome::Rejected => {}
            ChunkOutcome::Ack(ack) => {
                if let Some(receiver) = self.receivers.get(&transfer_id) {
                    out.push(Action::Event(SessionEvent::TransferProgress {
                        transfer_id,
                        done_chunks: receiver.received_chunks(),
                        total_chunks: receiver.chunk_count(),
                    }));
                }
                out.push(Action::Control(ack));
            }
            ChunkOutcome::Complete { data, ack } => {
                out.push(Action::Control(ack));
                out.push(Action::Event(SessionEvent::TransferReceived {
                    transfer_id,
                    data: data.clone(),
                }));
                out.push(Action::ProcessFile { transfer_id, data });
                self.receivers.remove(&transfer_id);
            }
            ChunkOutcome::Abort(err) => {
                out.push(Action::Control(err));
                self.receivers.remove(&transfer_id);
            }
        }
    }

    /// Housekeeping tick: ack-timeout checks across all outbound transfers.
    pub(crate) fn on_tick(&mut self, now: Instant) -> Vec<Action> {
        let mut out = Vec::new();
        if self.state != SessionState::Connected {
            return out;
        }
        let mut failed = Vec::new();
        for sender in self.senders.values_mut() {
            match sender.on_tick(now, self.config.ack_timeout) {
                SenderAction::Retransmit => Self::drain_window(sender, &mut out),
                SenderAction::Failed(reason) => failed.push((sender.id(), reason)),
                _ => {}
            }
        }
        for (transfer_id, reason) in failed {
            out.push(Action::Event(SessionEvent::TransferFailed {
                transfer_id,
                reason,
            }));
            self.senders.remove(&transfer_id);
        }
        out
    }

    /// Abort everything in flight. Safe from any state; further frames are
    /// ignored and no transfer retried.
    pub(crate) fn close(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.set_state(SessionState::Closing, &mut out);
        for (id, sender) in self.senders.iter_mut() {
            if !matches!(sender.state(), SenderState::Complete) {
                sender.abort();
                out.push(Action::Control(ControlMessage::FileError {
                    transfer_id: *id,
                    reason: FileErrorReason::Aborted,
                }));
                out.push(Action::Event(SessionEvent::TransferFailed {
                    transfer_id: *id,
                    reason: "session closed".into(),
                }));
            }
        }
        for (id, receiver) in self.receivers.iter_mut() {
            receiver.abort();
            out.push(Action::Event(SessionEvent::TransferFailed {
                transfer_id: *id,
                reason: "session closed".into(),
            }));
        }
        self.senders.clear();
        self.receivers.clear();
        out
    }
}

// ── Public session handle ────────────────────────────────────────────────────

/// A live peer session.
///
/// Obtained from [`Session::connect`]; dropped or closed sessions abort
/// their in-flight transfers.
pub struct Session {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    media: Arc<MediaRelay>,
}

impl Session {
    /// Establish a session: negotiate the peer connection, wait for the
    /// control channel, and start the dispatch actor.
    ///
    /// Returns the handle plus the event stream for the application.
    pub async fn connect(
        role: Role,
        config: PeerlinkConfig,
        signaling: Arc<dyn SignalingChannel>,
        processor: Arc<dyn Processor>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        let session_id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let mut core = SessionCore::new(session_id, config.clone());
        let mut pending = Vec::new();
        core.set_state(SessionState::Negotiating, &mut pending);
        for action in pending.drain(..) {
            if let Action::Event(ev) = action {
                let _ = event_tx.send(ev);
            }
        }

        let conn = match PeerConnection::open(role, &config, signaling, conn_tx).await {
            Ok(conn) => conn,
            Err(e) => {
                core.set_state(SessionState::Failed, &mut pending);
                for action in pending.drain(..) {
                    if let Action::Event(ev) = action {
                        let _ = event_tx.send(ev);
                    }
                }
                return Err(e);
            }
        };
        let ready = async {
            conn.wait_connected(config.negotiation_timeout).await?;
            conn.control().wait_open(config.channel_open_timeout).await
        };
        if let Err(e) = ready.await {
            // Release the ICE machinery and candidate pump before surfacing
            // the error; the signaling socket may outlive this attempt.
            if let Err(close_err) = conn.close().await {
                warn!(
                    event = "connect_cleanup_failed",
                    error = %close_err,
                    "Failed connection cleanup"
                );
            }
            core.set_state(SessionState::Failed, &mut pending);
            for action in pending.drain(..) {
                if let Action::Event(ev) = action {
                    let _ = event_tx.send(ev);
                }
            }
            return Err(e);
        }
        info!(
            event = "session_connected",
            session_id = %session_id,
            "Session established"
        );

        let media = Arc::new(MediaRelay::new(conn.inner(), config.media_queue_depth));
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let actor = SessionActor {
            core,
            conn,
            conn_rx,
            command_rx,
            event_tx,
            processor,
            command_tx: command_tx.clone(),
            media: media.clone(),
        };
        tokio::spawn(actor.run());

        Ok((
            Self {
                id: session_id,
                commands: command_tx,
                media,
            },
            event_rx,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Queue a text message for the peer.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::SendText(text.into()))
            .map_err(|_| PeerlinkError::Closed)
    }

    /// Transfer a file to the peer; returns the transfer id immediately.
    pub async fn send_file(&self, path: impl AsRef<Path>) -> Result<Uuid> {
        let data = tokio::fs::read(path.as_ref()).await?;
        self.send_bytes(Bytes::from(data))
    }

    /// Transfer an in-memory payload to the peer.
    pub fn send_bytes(&self, data: Bytes) -> Result<Uuid> {
        let transfer_id = Uuid::new_v4();
        self.commands
            .send(Command::SendData { transfer_id, data })
            .map_err(|_| PeerlinkError::Closed)?;
        Ok(transfer_id)
    }

    /// The media relay for attaching local tracks.
    pub fn media(&self) -> &MediaRelay {
        &self.media
    }

    /// Close the session: abort in-flight transfers, detach media, release
    /// the connection. Idempotent and safe from any state.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

struct SessionActor {
    core: SessionCore,
    conn: PeerConnection,
    conn_rx: mpsc::UnboundedReceiver<ConnEvent>,
    command_rx: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    processor: Arc<dyn Processor>,
    media: Arc<MediaRelay>,
}

/// One resolved input for the actor loop, so handlers run with the select
/// futures already dropped.
enum Input {
    Command(Command),
    Conn(ConnEvent),
    Tick,
    Stopped,
}

impl SessionActor {
    async fn run(mut self) {
        let mut pending = Vec::new();
        self.core.set_state(SessionState::Connected, &mut pending);
        self.apply(pending).await;

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let input = tokio::select! {
                cmd = self.command_rx.recv() => cmd.map_or(Input::Stopped, Input::Command),
                ev = self.conn_rx.recv() => ev.map_or(Input::Stopped, Input::Conn),
                _ = tick.tick() => Input::Tick,
            };
            match input {
                Input::Command(cmd) => {
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Input::Conn(ev) => {
                    if self.handle_conn_event(ev).await {
                        break;
                    }
                }
                Input::Tick => {
                    let actions = self.core.on_tick(Instant::now());
                    self.apply(actions).await;
                }
                Input::Stopped => {
                    self.fail("event source closed").await;
                    break;
                }
            }
        }

        debug!(event = "session_actor_stopped", session_id = %self.core.id, "Actor loop exited");
    }

    /// Returns `true` when the actor should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SendText(text) => {
                let msg = ControlMessage::Text { body: text };
                self.send_control(&msg).await;
                false
            }
            Command::SendData { transfer_id, data } => {
                let actions = self.core.start_transfer(transfer_id, data, Instant::now());
                self.apply(actions).await;
                false
            }
            Command::Close(done) => {
                let actions = self.core.close();
                self.apply(actions).await;
                self.media.detach_all().await;
                if let Err(e) = self.conn.close().await {
                    warn!(event = "close_failed", error = %e, "Peer connection close failed");
                }
                let mut pending = Vec::new();
                self.core.set_state(SessionState::Closed, &mut pending);
                self.apply(pending).await;
                let _ = done.send(());
                true
            }
        }
    }

    async fn handle_conn_event(&mut self, ev: ConnEvent) -> bool {
        match ev {
            ConnEvent::Frame(frame) => {
                let actions = self.core.handle_frame(frame, Instant::now());
                self.apply(actions).await;
                false
            }
            ConnEvent::TrackAdded(track) => {
                let _ = self.event_tx.send(SessionEvent::TrackAdded(track));
                false
            }
            ConnEvent::StateChanged(state) => self.handle_connection_state(state).await,
        }
    }

    async fn handle_connection_state(&mut self, state: ConnectionState) -> bool {
        let mut pending = Vec::new();
        match state {
            ConnectionState::Connected => {
                self.core.set_state(SessionState::Connected, &mut pending);
                self.apply(pending).await;
                false
            }
            ConnectionState::Disconnected => {
                if self.core.config.reconnect {
                    // ICE may recover the path; treat as a retry in progress.
                    self.core.set_state(SessionState::Negotiating, &mut pending);
                    self.apply(pending).await;
                    false
                } else {
                    self.fail("transport disconnected").await;
                    true
                }
            }
            ConnectionState::Failed => {
                self.fail("transport failed").await;
                true
            }
            ConnectionState::Closed => {
                let actions = self.core.close();
                self.apply(actions).await;
                self.core.set_state(SessionState::Closed, &mut pending);
                self.apply(pending).await;
                true
            }
            _ => false,
        }
    }

    /// Terminal transport failure: abort transfers, surface the error.
    async fn fail(&mut self, reason: &str) {
        warn!(
            event = "session_failed",
            session_id = %self.core.id,
            reason,
            "Session failed"
        );
        let actions = self.core.close();
        self.apply(actions).await;
        self.media.detach_all().await;
        let _ = self.conn.close().await;
        let mut pending = Vec::new();
        self.core.set_state(SessionState::Failed, &mut pending);
        self.apply(pending).await;
        let _ = self
            .event_tx
            .send(SessionEvent::Error(format!("transport error: {reason}")));
    }

    async fn send_control(&self, msg: &ControlMessage) {
        match encode_control_frame(msg) {
            Ok(frame) => {
                if let Err(e) = self.conn.control().send_frame(frame).await {
                    warn!(event = "control_send_failed", error = %e, "Control send failed");
                    let _ = self
                        .event_tx
                        .send(SessionEvent::Error(format!("send failed: {e}")));
                }
            }
            Err(e) => warn!(event = "control_encode_failed", error = %e, "Encode failed"),
        }
    }

    async fn apply(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Control(msg) => self.send_control(&msg).await,
                Action::Chunk {
                    transfer_id,
                    index,
                    data,
                } => {
                    let frame = encode_chunk_frame(transfer_id, index, &data);
                    if let Err(e) = self.conn.control().send_frame(frame).await {
                        // The retransmission timer recovers dropped windows.
                        warn!(
                            event = "chunk_send_failed",
                            transfer_id = %transfer_id,
                            index,
                            error = %e,
                            "Chunk send failed"
                        );
                    }
                }
                Action::Event(ev) => {
                    let _ = self.event_tx.send(ev);
                }
                Action::ProcessText(text) => {
                    let processor = self.processor.clone();
                    let commands = self.command_tx.clone();
                    let session_id = self.core.id;
                    tokio::spawn(async move {
                        if let Some(reply) = processor.process_text(session_id, text).await {
                            let _ = commands.send(Command::SendText(reply));
                        }
                    });
                }
                Action::ProcessFile { transfer_id, data } => {
                    let processor = self.processor.clone();
                    let commands = self.command_tx.clone();
                    let session_id = self.core.id;
                    tokio::spawn(async move {
                        if let Some(reply) =
                            processor.process_file(session_id, transfer_id, data).await
                        {
                            let _ = commands.send(Command::SendText(reply));
                        }
                    });
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
