//! SDP offer editing
//!
//! The locally generated offer is rewritten before it is sent:
//! - Opus in the first audio section is switched to stereo
//! - Codecs confirmed by the prober (PCMA/PCMU stereo, multichannel Opus,
//!   L16) are appended with freshly allocated dynamic payload types
//!
//! Editing is line based so that everything not touched is passed through
//! verbatim.

use std::collections::BTreeSet;

use super::codec::{CodecSet, NonAdvertisedCodec};
use super::signaling::MediaKind;
use crate::config::DYNAMIC_PAYLOAD_TYPES;
use crate::error::{AppError, Result};

/// Multichannel Opus layouts: channel count and fmtp parameters
const MULTIOPUS_LAYOUTS: [(u8, &str); 6] = [
    (3, "channel_mapping=0,2,1;num_streams=2;coupled_streams=1"),
    (4, "channel_mapping=0,1,2,3;num_streams=2;coupled_streams=2"),
    (5, "channel_mapping=0,4,1,2,3;num_streams=3;coupled_streams=2"),
    (6, "channel_mapping=0,4,1,2,3,5;num_streams=4;coupled_streams=2"),
    (7, "channel_mapping=0,4,1,2,3,5,6;num_streams=4;coupled_streams=4"),
    (8, "channel_mapping=0,6,1,4,5,2,3,7;num_streams=5;coupled_streams=4"),
];

const L16_CLOCK_RATES: [u32; 3] = [8000, 16000, 48000];

/// Feedback attached to every payload type added by the editor
const TRANSPORT_CC: &str = "transport-cc";

/// One media section: the `m=` line followed by its attribute lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSection {
    lines: Vec<String>,
}

impl MediaSection {
    fn m_line(&self) -> &str {
        self.lines[0].strip_prefix("m=").unwrap_or(&self.lines[0])
    }

    /// Media kind token (`audio`, `video`, `application`, ...)
    pub fn kind(&self) -> &str {
        self.m_line().split_whitespace().next().unwrap_or("")
    }

    pub fn is_kind(&self, kind: MediaKind) -> bool {
        self.kind() == kind.to_string()
    }

    /// Payload types listed on the `m=` line
    pub fn payload_types(&self) -> impl Iterator<Item = &str> {
        self.m_line().split_whitespace().skip(3)
    }

    pub fn has_payload_type(&self, payload_type: u8) -> bool {
        let pt = payload_type.to_string();
        self.payload_types().any(|p| p == pt)
    }

    pub fn add_payload_type(&mut self, payload_type: u8) {
        self.lines[0].push_str(&format!(" {}", payload_type));
    }

    /// Lowest dynamic payload type not listed on the `m=` line
    pub fn free_payload_type(&self) -> Result<u8> {
        DYNAMIC_PAYLOAD_TYPES
            .into_iter()
            .find(|pt| !self.has_payload_type(*pt))
            .ok_or_else(|| {
                AppError::NegotiationSetup("unable to find a free payload type".to_string())
            })
    }

    /// Reserve the lowest free payload type by appending it to the `m=` line
    pub fn allocate_payload_type(&mut self) -> Result<u8> {
        let pt = self.free_payload_type()?;
        self.add_payload_type(pt);
        Ok(pt)
    }

    /// Append an attribute line (`a=` prefix added) at the end of the section
    pub fn push_attribute(&mut self, attribute: impl AsRef<str>) {
        self.lines.push(format!("a={}", attribute.as_ref()));
    }

    /// Append an `rtpmap`, optional `fmtp`, and optional feedback for a payload type
    pub fn push_codec(&mut self, payload_type: u8, codec: &str, fmtp: Option<&str>, feedback: Option<&str>) {
        self.push_attribute(format!("rtpmap:{} {}", payload_type, codec));
        if let Some(fmtp) = fmtp {
            self.push_attribute(format!("fmtp:{} {}", payload_type, fmtp));
        }
        if let Some(feedback) = feedback {
            self.push_attribute(format!("rtcp-fb:{} {}", payload_type, feedback));
        }
    }

    /// Codec names of the `a=rtpmap` lines (e.g. `opus/48000/2`)
    pub fn codecs(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter_map(|line| line.strip_prefix("a=rtpmap:"))
            .filter_map(|rtpmap| rtpmap.split_once(' ').map(|(_, codec)| codec.trim()))
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// SDP split into its session part and media sections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpDocument {
    session: Vec<String>,
    media: Vec<MediaSection>,
}

impl SdpDocument {
    /// Split an SDP blob into lines; accepts both CRLF and LF line endings
    pub fn parse(sdp: &str) -> Self {
        let mut session = Vec::new();
        let mut media: Vec<MediaSection> = Vec::new();

        for line in sdp.lines().filter(|l| !l.is_empty()) {
            if line.starts_with("m=") {
                media.push(MediaSection {
                    lines: vec![line.to_string()],
                });
            } else if let Some(section) = media.last_mut() {
                section.lines.push(line.to_string());
            } else {
                session.push(line.to_string());
            }
        }

        Self { session, media }
    }

    pub fn media(&self) -> &[MediaSection] {
        &self.media
    }

    /// First media section of the given kind
    pub fn first_media_mut(&mut self, kind: MediaKind) -> Option<&mut MediaSection> {
        self.media.iter_mut().find(|m| m.is_kind(kind))
    }

    /// Lowercased codec names advertised by any media section
    pub fn codecs(&self) -> BTreeSet<String> {
        self.media
            .iter()
            .flat_map(|m| m.codecs())
            .map(str::to_ascii_lowercase)
            .collect()
    }

    /// Check whether any line contains ` <codec>` (ASCII case-insensitive)
    pub fn advertises(&self, codec: &str) -> bool {
        let needle = format!(" {}", codec.to_ascii_lowercase());
        self.session
            .iter()
            .chain(self.media.iter().flat_map(|m| m.lines.iter()))
            .any(|line| line.to_ascii_lowercase().contains(&needle))
    }
}

impl std::fmt::Display for SdpDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for line in self
            .session
            .iter()
            .chain(self.media.iter().flat_map(|m| m.lines.iter()))
        {
            write!(f, "{}\r\n", line)?;
        }
        Ok(())
    }
}

/// Rewrite a local offer's first audio section
///
/// Sections other than the first audio section are left untouched. An offer
/// without an audio section is returned unchanged apart from line endings.
pub fn edit_offer(sdp: &str, codecs: &CodecSet) -> Result<String> {
    let mut doc = SdpDocument::parse(sdp);

    if let Some(audio) = doc.first_media_mut(MediaKind::Audio) {
        enable_stereo_opus(audio);

        if codecs.contains(NonAdvertisedCodec::PcmaStereo) {
            enable_stereo_pcmau(audio)?;
        }
        if codecs.contains(NonAdvertisedCodec::MultiOpus) {
            enable_multichannel_opus(audio)?;
        }
        if codecs.contains(NonAdvertisedCodec::L16Stereo) {
            enable_l16(audio)?;
        }
    }

    Ok(doc.to_string())
}

/// Add `stereo=1` and `sprop-stereo=1` to the Opus fmtp line
///
/// Parameters already present are never added twice.
pub fn enable_stereo_opus(section: &mut MediaSection) {
    let opus_pt = section.lines.iter().find_map(|line| {
        let rtpmap = line.strip_prefix("a=rtpmap:")?;
        if !rtpmap.to_ascii_lowercase().contains("opus/") {
            return None;
        }
        rtpmap.split_whitespace().next().map(str::to_string)
    });

    let Some(opus_pt) = opus_pt else {
        return;
    };

    let prefix = format!("a=fmtp:{} ", opus_pt);
    for line in section.lines.iter_mut().filter(|l| l.starts_with(&prefix)) {
        for param in ["stereo", "sprop-stereo"] {
            let present = line[prefix.len()..]
                .split(';')
                .filter_map(|p| p.split('=').next())
                .any(|key| key.trim().eq_ignore_ascii_case(param));
            if present {
                continue;
            }
            if line[prefix.len()..].trim().is_empty() {
                line.push_str(&format!("{}=1", param));
            } else {
                line.push_str(&format!(";{}=1", param));
            }
        }
    }
}

fn enable_stereo_pcmau(section: &mut MediaSection) -> Result<()> {
    for codec in ["PCMU/8000/2", "PCMA/8000/2"] {
        let pt = section.allocate_payload_type()?;
        section.push_codec(pt, codec, None, Some(TRANSPORT_CC));
    }
    Ok(())
}

fn enable_multichannel_opus(section: &mut MediaSection) -> Result<()> {
    for (channels, fmtp) in MULTIOPUS_LAYOUTS {
        let pt = section.allocate_payload_type()?;
        let codec = format!("multiopus/48000/{}", channels);
        section.push_codec(pt, &codec, Some(fmtp), Some(TRANSPORT_CC));
    }
    Ok(())
}

fn enable_l16(section: &mut MediaSection) -> Result<()> {
    for rate in L16_CLOCK_RATES {
        let pt = section.allocate_payload_type()?;
        let codec = format!("L16/{}/2", rate);
        section.push_codec(pt, &codec, None, Some(TRANSPORT_CC));
    }
    Ok(())
}

/// Connectivity data extracted from the edited local offer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OfferData {
    pub ice_ufrag: String,
    pub ice_pwd: String,
    /// `m=` line contents (without the `m=` prefix), in offer order
    pub medias: Vec<String>,
}

impl OfferData {
    /// Collect every media line and the first ufrag/pwd pair
    pub fn parse(sdp: &str) -> Self {
        let mut data = Self::default();

        for line in sdp.lines() {
            if let Some(media) = line.strip_prefix("m=") {
                data.medias.push(media.to_string());
            } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
                if data.ice_ufrag.is_empty() {
                    data.ice_ufrag = ufrag.to_string();
                }
            } else if let Some(pwd) = line.strip_prefix("a=ice-pwd:") {
                if data.ice_pwd.is_empty() {
                    data.ice_pwd = pwd.to_string();
                }
            }
        }

        data
    }
}
