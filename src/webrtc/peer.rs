//! webrtc-rs backed transport

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::config::IceServer;
use super::sdp::SdpDocument;
use super::signaling::{ConnectionState, IceCandidate, IceConnectionState, MediaKind};
use super::transport::{
    PeerTransport, ReceivedTrack, TrackInfo, TransportEvent, TransportEventSender, TransportFactory,
};
use crate::error::{AppError, Result};

fn map_connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => return None,
    })
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    })
}

fn track_info(track: &TrackRemote) -> TrackInfo {
    TrackInfo {
        id: track.id(),
        stream_id: track.stream_id(),
        kind: match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        },
        mime_type: track.codec().capability.mime_type,
        payload_type: track.payload_type(),
        ssrc: track.ssrc(),
    }
}

/// Received track with the transceiver that carries it
struct TrackEntry {
    track: ReceivedTrack,
    transceiver: Arc<RTCRtpTransceiver>,
}

impl TrackEntry {
    fn is_live(&self) -> bool {
        self.transceiver.current_direction().has_recv()
    }
}

/// Receive-only peer connection
///
/// webrtc-rs only accepts the offer it generated itself as local
/// description. Edited offers are sent to the server as they are, while the
/// library gets its own offer back, as long as the edit only touched format
/// parameters of codecs the media engine already offered.
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    tracks: Arc<Mutex<Vec<TrackEntry>>>,
    generated_offer: Mutex<Option<String>>,
}

impl WebRtcTransport {
    async fn new(ice_servers: &[IceServer], events: TransportEventSender) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Transport(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::Transport(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::Transport(format!("Failed to create peer connection: {}", e))
        })?;

        let transport = Self {
            pc: Arc::new(pc),
            tracks: Arc::new(Mutex::new(Vec::new())),
            generated_offer: Mutex::new(None),
        };
        transport.setup_event_handlers(events);

        Ok(transport)
    }

    fn setup_event_handlers(&self, events: TransportEventSender) {
        let generation = events.generation();

        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                if let Some(state) = map_connection_state(s) {
                    debug!("Attempt {} connection state: {}", generation, state);
                    tx.send(TransportEvent::ConnectionState(state));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                if let Some(state) = map_ice_state(s) {
                    debug!("Attempt {} ICE state: {}", generation, state);
                    tx.send(TransportEvent::IceConnectionState(state));
                }
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                // None marks the end of gathering
                if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                    debug!("Local ICE candidate: {}", init.candidate);
                    tx.send(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Box::pin(async {})
            }));

        let tracks = self.tracks.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, transceiver: Arc<RTCRtpTransceiver>| {
                let received = ReceivedTrack::new(track_info(&track), track);
                info!(
                    "Track received: {} ({}, {})",
                    received.info.id, received.info.kind, received.info.mime_type
                );
                tracks.lock().push(TrackEntry {
                    track: received.clone(),
                    transceiver,
                });
                events.send(TransportEvent::Track(received));
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_recvonly_transceiver(&self, kind: MediaKind) -> Result<()> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };

        self.pc
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| AppError::Transport(format!("Failed to add {} transceiver: {}", kind, e)))?;

        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to create offer: {}", e)))?;
        *self.generated_offer.lock() = Some(offer.sdp.clone());
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, offer_sdp: &str) -> Result<()> {
        let generated = self
            .generated_offer
            .lock()
            .clone()
            .ok_or_else(|| AppError::Transport("No offer has been created".to_string()))?;

        if offer_sdp != generated {
            let unsupported = unsupported_codecs(&generated, offer_sdp);
            if !unsupported.is_empty() {
                return Err(AppError::Transport(format!(
                    "Unsupported codecs in local offer: {}",
                    unsupported.join(", ")
                )));
            }
            debug!("Offer edited, applying the generated offer locally");
        }

        let sdp = RTCSessionDescription::offer(generated)
            .map_err(|e| AppError::Transport(format!("Invalid SDP offer: {}", e)))?;

        self.pc
            .set_local_description(sdp)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, answer_sdp: &str) -> Result<()> {
        let sdp = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| AppError::Transport(format!("Invalid SDP answer: {}", e)))?;

        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to set remote description: {}", e)))
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state()).unwrap_or(ConnectionState::New)
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.pc.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    async fn live_tracks(&self) -> Vec<ReceivedTrack> {
        self.tracks
            .lock()
            .iter()
            .filter(|entry| entry.is_live())
            .map(|entry| entry.track.clone())
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to close peer connection: {}", e)))
    }
}

/// Codecs in `edited` that the generated offer does not carry
fn unsupported_codecs(generated: &str, edited: &str) -> Vec<String> {
    let offered = SdpDocument::parse(generated).codecs();
    SdpDocument::parse(edited)
        .codecs()
        .into_iter()
        .filter(|codec| !offered.contains(codec))
        .collect()
}

/// Creates a fresh webrtc-rs peer connection per attempt
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(ice_servers, events).await?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::codec::{CodecSet, NonAdvertisedCodec};
    use crate::webrtc::probe::probe_all;
    use crate::webrtc::reader::apply_local_offer;

    async fn transport() -> Arc<dyn PeerTransport> {
        WebRtcTransportFactory::new()
            .create(&[], TransportEventSender::detached())
            .await
            .unwrap()
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            Some(ConnectionState::Failed)
        );
        assert_eq!(map_connection_state(RTCPeerConnectionState::Unspecified), None);
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            Some(IceConnectionState::Completed)
        );
    }

    #[tokio::test]
    async fn test_offer_has_recvonly_sections() {
        let factory = WebRtcTransportFactory::new();
        let transport = factory
            .create(&[], TransportEventSender::detached())
            .await
            .unwrap();

        transport.add_recvonly_transceiver(MediaKind::Video).await.unwrap();
        transport.add_recvonly_transceiver(MediaKind::Audio).await.unwrap();
        let offer = transport.create_offer().await.unwrap();

        let video = offer.find("m=video").unwrap();
        let audio = offer.find("m=audio").unwrap();
        assert!(video < audio);
        assert!(offer.contains("a=recvonly"));
        assert!(offer.to_ascii_lowercase().contains("opus/48000/2"));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_edited_offer_is_applied() {
        let transport = transport().await;

        let (sdp, offer) = apply_local_offer(transport.as_ref(), &CodecSet::new())
            .await
            .unwrap();
        assert!(sdp.contains(";stereo=1;sprop-stereo=1"));
        assert_eq!(offer.medias.len(), 2);
        assert!(offer.medias[0].starts_with("video "));

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_added_codecs_are_rejected() {
        let transport = transport().await;

        let codecs: CodecSet = NonAdvertisedCodec::ALL.into_iter().collect();
        match apply_local_offer(transport.as_ref(), &codecs).await {
            Err(AppError::Transport(message)) => {
                assert!(message.starts_with("Unsupported codecs in local offer"));
                assert!(message.contains("pcma/8000/2"));
            }
            other => panic!("expected transport error, got {:?}", other.map(|(sdp, _)| sdp)),
        }

        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_prober_finds_no_extra_codecs() {
        let codecs = probe_all(&WebRtcTransportFactory::new(), 118).await;
        assert!(codecs.is_empty());
    }

    #[tokio::test]
    async fn test_live_tracks_skip_idle_transceivers() {
        let transport = WebRtcTransport::new(&[], TransportEventSender::detached())
            .await
            .unwrap();
        let transceiver = transport
            .pc
            .add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await
            .unwrap();
        let info = TrackInfo {
            id: "audio".to_string(),
            stream_id: "stream".to_string(),
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            ssrc: 1,
        };
        transport.tracks.lock().push(TrackEntry {
            track: ReceivedTrack::new(info, Arc::new(())),
            transceiver: transceiver.clone(),
        });

        // never negotiated
        assert!(transport.live_tracks().await.is_empty());

        transceiver.stop().await.unwrap();
        assert!(transport.live_tracks().await.is_empty());

        transport.close().await.unwrap();
    }

    #[test]
    fn test_unsupported_codecs() {
        let generated = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\na=fmtp:111 minptime=10\r\n";
        let edited = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111 96\r\na=rtpmap:111 OPUS/48000/2\r\na=fmtp:111 minptime=10;stereo=1\r\na=rtpmap:96 L16/48000/2\r\n";

        assert!(unsupported_codecs(generated, generated).is_empty());
        assert_eq!(unsupported_codecs(generated, edited), vec!["l16/48000/2".to_string()]);
    }
}
