//! Non-advertised codec probing
//!
//! A transport may be able to negotiate codecs it does not put in its own
//! offers. Each probe builds a throwaway transport, adds the codec to an offer
//! by hand and applies a synthetic answer that selects it. No connectivity is
//! ever established; only local SDP negotiation is exercised.

use tracing::{debug, info};

use super::codec::{CodecSet, NonAdvertisedCodec};
use super::sdp::SdpDocument;
use super::signaling::MediaKind;
use super::transport::{PeerTransport, TransportEventSender, TransportFactory};
use crate::error::{AppError, Result};

/// Placeholder DTLS fingerprint of the synthetic answer
const PROBE_FINGERPRINT: &str = "sha-256 0D:9F:78:15:42:B5:4B:E6:E2:94:3E:5B:37:78:E1:4B:54:59:A3:36:3A:E5:05:EB:27:EE:8F:D2:2D:41:29:25";
const PROBE_ICE_UFRAG: &str = "29e036dc";
const PROBE_ICE_PWD: &str = "7c3bf4770007e7432ee4ea4d697db675";

/// Check whether the transport can negotiate `codec` when it is added by hand
///
/// Returns false when the codec is already advertised (nothing to add) and
/// on any failure. The throwaway transport is always closed.
pub async fn probe(
    factory: &dyn TransportFactory,
    codec: &str,
    fmtp: Option<&str>,
    payload_type: u8,
) -> bool {
    let transport = match factory.create(&[], TransportEventSender::detached()).await {
        Ok(t) => t,
        Err(e) => {
            debug!("Probe {}: failed to create transport: {}", codec, e);
            return false;
        }
    };

    let result = run_probe(transport.as_ref(), codec, fmtp, payload_type).await;

    if let Err(e) = transport.close().await {
        debug!("Probe {}: failed to close transport: {}", codec, e);
    }

    match result {
        Ok(supported) => supported,
        Err(e) => {
            debug!("Probe {}: not supported: {}", codec, e);
            false
        }
    }
}

async fn run_probe(
    transport: &dyn PeerTransport,
    codec: &str,
    fmtp: Option<&str>,
    payload_type: u8,
) -> Result<bool> {
    transport.add_recvonly_transceiver(MediaKind::Audio).await?;
    let offer = transport.create_offer().await?;

    let mut doc = SdpDocument::parse(&offer);
    if doc.advertises(codec) {
        debug!("Probe {}: already advertised", codec);
        return Ok(false);
    }

    let audio = doc
        .first_media_mut(MediaKind::Audio)
        .ok_or_else(|| AppError::NegotiationSetup("probe offer has no audio section".to_string()))?;
    let mid = audio
        .lines()
        .iter()
        .find_map(|l| l.strip_prefix("a=mid:"))
        .map(str::to_string);
    audio.add_payload_type(payload_type);
    audio.push_codec(payload_type, codec, fmtp, None);

    transport.set_local_description(&doc.to_string()).await?;
    transport
        .set_remote_description(&synthetic_answer(codec, fmtp, payload_type, mid.as_deref()))
        .await?;

    Ok(true)
}

/// Minimal answer selecting only the probed payload type
fn synthetic_answer(codec: &str, fmtp: Option<&str>, payload_type: u8, mid: Option<&str>) -> String {
    let mut sdp = format!(
        "v=0\r\n\
         o=- 6539324223450680508 0 IN IP4 0.0.0.0\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=fingerprint:{}\r\n\
         m=audio 9 UDP/TLS/RTP/SAVPF {}\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=ice-pwd:{}\r\n\
         a=ice-ufrag:{}\r\n",
        PROBE_FINGERPRINT, payload_type, PROBE_ICE_PWD, PROBE_ICE_UFRAG
    );
    if let Some(mid) = mid {
        sdp.push_str(&format!("a=mid:{}\r\n", mid));
    }
    sdp.push_str("a=sendonly\r\na=rtcp-mux\r\n");
    sdp.push_str(&format!("a=rtpmap:{} {}\r\n", payload_type, codec));
    if let Some(fmtp) = fmtp {
        sdp.push_str(&format!("a=fmtp:{} {}\r\n", payload_type, fmtp));
    }
    sdp
}

/// Run every codec probe concurrently and keep the supported ones
pub async fn probe_all(factory: &dyn TransportFactory, payload_type: u8) -> CodecSet {
    let probes = NonAdvertisedCodec::ALL.map(|codec| async move {
        let supported = probe(factory, codec.rtpmap(), codec.probe_fmtp(), payload_type).await;
        supported.then_some(codec)
    });

    let codecs: CodecSet = futures::future::join_all(probes)
        .await
        .into_iter()
        .flatten()
        .collect();

    info!("Non-advertised codecs supported: {}", codecs);
    codecs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::transport::mock::{MockFactory, MOCK_OFFER};

    #[tokio::test]
    async fn test_probe_supported() {
        let factory = MockFactory::default();

        assert!(probe(&factory, "pcma/8000/2", None, 118).await);

        let control = factory.control.lock();
        assert_eq!(control.created, 1);
        assert_eq!(control.closed, 1);
        let local = &control.local_descriptions[0];
        assert!(local.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111 0 8 118\r\n"));
        assert!(local.ends_with("a=rtpmap:118 pcma/8000/2\r\n"));
        let answer = &control.remote_descriptions[0];
        assert!(answer.contains("m=audio 9 UDP/TLS/RTP/SAVPF 118\r\n"));
        assert!(answer.contains("a=mid:1\r\n"));
    }

    #[tokio::test]
    async fn test_probe_with_fmtp() {
        let factory = MockFactory::default();
        let codec = NonAdvertisedCodec::MultiOpus;

        assert!(probe(&factory, codec.rtpmap(), codec.probe_fmtp(), 118).await);

        let control = factory.control.lock();
        assert!(control.local_descriptions[0].ends_with(
            "a=rtpmap:118 multiopus/48000/6\r\na=fmtp:118 channel_mapping=0,4,1,2,3,5;num_streams=4;coupled_streams=2\r\n"
        ));
        assert!(control.remote_descriptions[0]
            .ends_with("a=fmtp:118 channel_mapping=0,4,1,2,3,5;num_streams=4;coupled_streams=2\r\n"));
    }

    #[tokio::test]
    async fn test_probe_already_advertised() {
        let factory = MockFactory::default();
        factory.control.lock().offer = Some(MOCK_OFFER.replace(
            "a=rtpmap:8 PCMA/8000\r\n",
            "a=rtpmap:8 PCMA/8000\r\na=rtpmap:100 L16/48000/2\r\n",
        ));

        assert!(!probe(&factory, "L16/48000/2", None, 118).await);

        let control = factory.control.lock();
        assert!(control.local_descriptions.is_empty());
        assert_eq!(control.closed, 1);
    }

    #[tokio::test]
    async fn test_probe_rejected() {
        let factory = MockFactory::default();
        factory.control.lock().fail_remote_description = true;

        assert!(!probe(&factory, "L16/48000/2", None, 118).await);
        assert_eq!(factory.control.lock().closed, 1);
    }

    #[tokio::test]
    async fn test_probe_all() {
        let factory = MockFactory::default();
        factory
            .control
            .lock()
            .reject_answer_containing
            .push("multiopus".to_string());

        let codecs = probe_all(&factory, 118).await;

        assert_eq!(codecs.len(), 2);
        assert!(codecs.contains(NonAdvertisedCodec::PcmaStereo));
        assert!(!codecs.contains(NonAdvertisedCodec::MultiOpus));
        assert!(codecs.contains(NonAdvertisedCodec::L16Stereo));

        let control = factory.control.lock();
        assert_eq!(control.created, 3);
        assert_eq!(control.closed, 3);
    }
}
