//! Media track relay: local track attachment and outbound frame delivery.
//!
//! Inbound tracks surface through `ConnEvent::TrackAdded` and are consumed
//! by an external render collaborator; this module owns the outbound path.
//! Live media favors recency over completeness, so the outbound queue drops
//! the oldest frame under sustained backpressure. The file transfer's
//! reliable channel is unaffected and never drops.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::Result;

// ── Drop-oldest queue ────────────────────────────────────────────────────────

/// Bounded queue that drops the oldest element when full.
pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue a frame, evicting the oldest when at capacity.
    /// Returns `true` when an old frame was dropped.
    pub async fn push(&self, item: T) -> bool {
        let mut q = self.inner.lock().await;
        let dropped = if q.len() == self.capacity {
            q.pop_front();
            true
        } else {
            false
        };
        q.push_back(item);
        drop(q);
        self.notify.notify_one();
        dropped
    }

    /// Dequeue the next frame, waiting for one if the queue is empty.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.inner.lock().await.pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

// ── Relay ────────────────────────────────────────────────────────────────────

/// A local track bound to the session for outbound delivery.
pub struct MediaBinding {
    track: Arc<TrackLocalStaticSample>,
    rtp_sender: Arc<RTCRtpSender>,
    queue: Arc<FrameQueue<Sample>>,
    pump: tokio::task::JoinHandle<()>,
}

impl MediaBinding {
    /// Submit one frame for delivery. Under backpressure the oldest queued
    /// frame is silently replaced.
    pub async fn push_frame(&self, sample: Sample) {
        if self.queue.push(sample).await {
            debug!(
                event = "media_frame_dropped",
                track = %self.track.id(),
                "Outbound media queue full, dropped oldest frame"
            );
        }
    }
}

/// Binds local media sources to a peer connection.
pub struct MediaRelay {
    pc: Arc<RTCPeerConnection>,
    queue_depth: usize,
    bindings: Mutex<Vec<MediaBinding>>,
}

impl MediaRelay {
    pub(crate) fn new(pc: Arc<RTCPeerConnection>, queue_depth: usize) -> Self {
        Self {
            pc,
            queue_depth,
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Attach a local media source for outbound delivery.
    ///
    /// Returns a handle the capture collaborator pushes frames into; a pump
    /// task forwards queued frames to the track.
    pub async fn attach(
        &self,
        codec: RTCRtpCodecCapability,
        track_id: &str,
    ) -> Result<Arc<FrameQueue<Sample>>> {
        let track = Arc::new(TrackLocalStaticSample::new(
            codec,
            track_id.to_string(),
            "peerlink".to_string(),
        ));
        let rtp_sender = self
            .pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        info!(event = "track_attached", track = %track_id, "Local media track attached");

        let queue = Arc::new(FrameQueue::new(self.queue_depth));
        let pump_queue = queue.clone();
        let pump_track = track.clone();
        let pump = tokio::spawn(async move {
            loop {
                let sample = pump_queue.pop().await;
                if let Err(e) = pump_track.write_sample(&sample).await {
                    warn!(
                        event = "media_write_failed",
                        track = %pump_track.id(),
                        error = %e,
                        "Stopping media pump"
                    );
                    break;
                }
            }
        });

        self.bindings.lock().await.push(MediaBinding {
            track,
            rtp_sender,
            queue: queue.clone(),
            pump,
        });
        Ok(queue)
    }

    /// Detach all local tracks. Called on session close; idempotent.
    pub async fn detach_all(&self) {
        let mut bindings = self.bindings.lock().await;
        for binding in bindings.drain(..) {
            binding.pump.abort();
            if let Err(e) = self.pc.remove_track(&binding.rtp_sender).await {
                debug!(
                    event = "track_detach_failed",
                    track = %binding.track.id(),
                    error = %e,
                    "Track removal failed (connection may be closed)"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_drops_oldest_under_backpressure() {
        let q: FrameQueue<u32> = FrameQueue::new(3);
        assert!(!q.push(1).await);
        assert!(!q.push(2).await);
        assert!(!q.push(3).await);
        // Full: 4 evicts 1, 5 evicts 2.
        assert!(q.push(4).await);
        assert!(q.push(5).await);
        assert_eq!(q.len().await, 3);

        // Recency preserved: the oldest survivors come out first.
        assert_eq!(q.pop().await, 3);
        assert_eq!(q.pop().await, 4);
        assert_eq!(q.pop().await, 5);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q: Arc<FrameQueue<u32>> = Arc::new(FrameQueue::new(2));
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(7).await;
        assert_eq!(waiter.await.unwrap(), 7);
    }
}
