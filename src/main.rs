//! Demo binary: two peers over TCP signaling.
//!
//! The answerer listens on the signaling address; the offerer connects to it.
//! Both sides run an echo processor, so text sent from either end comes back
//! as `response to: <text>`, and a completed file transfer is acknowledged
//! with its size.

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use peerlink::{PeerlinkConfig, Processor, Role, Session, SessionEvent, TcpSignaling};

/// Peerlink demo - P2P data and media sessions.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Which side of the negotiation to play.
    #[clap(value_enum)]
    role: CliRole,

    /// Signaling endpoint: the answerer binds it, the offerer connects to it.
    #[clap(short, long, default_value = "127.0.0.1:9400")]
    endpoint: String,

    /// File to send to the peer once connected.
    #[clap(long)]
    send_file: Option<PathBuf>,

    /// Text message to send to the peer once connected.
    #[clap(long)]
    send_text: Option<String>,

    /// File chunk size in bytes.
    #[clap(long)]
    chunk_size: Option<usize>,

    /// Sliding-window width (max unacknowledged chunks in flight).
    #[clap(long)]
    window: Option<u32>,

    /// Receiver ack batch (acknowledge after every N chunks).
    #[clap(long)]
    ack_batch: Option<u32>,

    /// Retry budget per transfer.
    #[clap(long)]
    retries: Option<u32>,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliRole {
    Offer,
    Answer,
}

impl Args {
    fn config(&self) -> PeerlinkConfig {
        let mut config = PeerlinkConfig::default();
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(window) = self.window {
            config.window_size = window;
        }
        if let Some(ack_batch) = self.ack_batch {
            config.ack_batch = ack_batch;
        }
        if let Some(retries) = self.retries {
            config.retry_budget = retries;
        }
        config
    }
}

/// Placeholder processor: echoes text and acknowledges files.
struct EchoProcessor;

#[async_trait]
impl Processor for EchoProcessor {
    async fn process_text(&self, _session_id: Uuid, text: String) -> Option<String> {
        Some(format!("response to: {text}"))
    }

    async fn process_file(
        &self,
        _session_id: Uuid,
        transfer_id: Uuid,
        data: Bytes,
    ) -> Option<String> {
        Some(format!("received file {transfer_id} ({} bytes)", data.len()))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // webrtc_ice logs late-arriving STUN responses as warnings; these are
    // normal, so keep that target quiet below -vvv.
    let filter = match args.verbose {
        0 => "warn,peerlink=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let signaling = match args.role {
        CliRole::Offer => Arc::new(TcpSignaling::connect(&args.endpoint).await?),
        CliRole::Answer => {
            info!(event = "signaling_listen", endpoint = %args.endpoint, "Waiting for peer");
            Arc::new(TcpSignaling::accept(&args.endpoint).await?)
        }
    };
    let role = match args.role {
        CliRole::Offer => Role::Offer,
        CliRole::Answer => Role::Answer,
    };

    let (session, mut events) =
        Session::connect(role, args.config(), signaling, Arc::new(EchoProcessor)).await?;
    info!(event = "session_ready", session_id = %session.id(), "Session established");

    if let Some(text) = &args.send_text {
        session.send_text(text.clone())?;
    }
    if let Some(path) = &args.send_file {
        let transfer_id = session.send_file(path).await?;
        info!(event = "transfer_started", %transfer_id, path = %path.display(), "Sending file");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(event = "shutdown", "Closing session");
                session.close().await;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::TextReceived(text) => println!("peer: {text}"),
                    SessionEvent::TransferReceived { transfer_id, data } => {
                        println!("received transfer {transfer_id}: {} bytes", data.len());
                    }
                    SessionEvent::TransferSent { transfer_id } => {
                        println!("transfer {transfer_id} delivered");
                    }
                    SessionEvent::TransferFailed { transfer_id, reason } => {
                        println!("transfer {transfer_id} failed: {reason}");
                    }
                    SessionEvent::TransferProgress { transfer_id, done_chunks, total_chunks } => {
                        info!(
                            event = "transfer_progress",
                            %transfer_id,
                            done_chunks,
                            total_chunks,
                            "Transfer progress"
                        );
                    }
                    SessionEvent::StateChanged(state) => {
                        info!(event = "state", ?state, "Session state");
                    }
                    SessionEvent::TrackAdded(track) => {
                        info!(event = "remote_track", kind = %track.kind(), "Remote track added");
                    }
                    SessionEvent::Error(message) => eprintln!("session error: {message}"),
                }
            }
        }
    }

    Ok(())
}
