//! Real-time transport capability interface
//!
//! The reader never touches RTP itself. It drives a peer connection through
//! [`PeerTransport`] and learns about candidates, state changes and incoming
//! tracks from [`TransportEvent`]s. [`super::peer::WebRtcTransportFactory`]
//! implements it on top of webrtc-rs.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::config::IceServer;
use super::signaling::{ConnectionState, IceCandidate, IceConnectionState, MediaKind};
use crate::error::Result;

/// Description of a received remote track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Negotiated codec MIME type (e.g., "audio/opus")
    pub mime_type: String,
    pub payload_type: u8,
    pub ssrc: u32,
}

/// Transport-specific track object (downcast by the host)
pub type MediaHandle = Arc<dyn Any + Send + Sync>;

/// A received track plus the transport object that delivers its media
#[derive(Clone)]
pub struct ReceivedTrack {
    pub info: TrackInfo,
    pub media: MediaHandle,
}

impl ReceivedTrack {
    pub fn new(info: TrackInfo, media: MediaHandle) -> Self {
        Self { info, media }
    }

    /// Borrow the underlying transport track, e.g. `webrtc::track::track_remote::TrackRemote`
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.media.clone().downcast::<T>().ok()
    }
}

impl std::fmt::Debug for ReceivedTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedTrack").field("info", &self.info).finish()
    }
}

/// Notifications raised by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Local ICE candidate gathered
    LocalCandidate(IceCandidate),
    /// Peer connection state changed
    ConnectionState(ConnectionState),
    /// ICE connection state changed
    IceConnectionState(IceConnectionState),
    /// Remote track received
    Track(ReceivedTrack),
}

/// Event sender handed to a transport at creation
///
/// Every event is tagged with the attempt generation the transport belongs
/// to, so events from a replaced transport can be told apart.
#[derive(Debug, Clone)]
pub struct TransportEventSender {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEventSender {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Sender whose events go nowhere (throwaway transports)
    pub fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Send an event; events for a stopped reader are dropped
    pub fn send(&self, event: TransportEvent) {
        let _ = self.tx.send((self.generation, event));
    }
}

/// Peer connection driven by the reader
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Add a receive-only transceiver
    async fn add_recvonly_transceiver(&self, kind: MediaKind) -> Result<()>;

    /// Generate a local offer SDP
    async fn create_offer(&self) -> Result<String>;

    /// Apply an (edited) offer as local description
    async fn set_local_description(&self, offer_sdp: &str) -> Result<()>;

    /// Apply the remote answer
    async fn set_remote_description(&self, answer_sdp: &str) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    fn ice_connection_state(&self) -> IceConnectionState;

    /// Tracks currently delivering media
    async fn live_tracks(&self) -> Vec<ReceivedTrack>;

    /// Close the peer connection
    async fn close(&self) -> Result<()>;
}

/// Creates one transport per negotiation attempt
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}
