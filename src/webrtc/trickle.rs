//! Trickle ICE candidate batching
//!
//! Local candidates gathered before the session URL is known are queued and
//! delivered in one `application/trickle-ice-sdpfrag` PATCH after the answer
//! has been applied. Later candidates are sent one by one.

use std::collections::BTreeMap;

use super::sdp::OfferData;
use super::signaling::IceCandidate;

/// Pending local candidates of one attempt
///
/// The queue accepts candidates until it is flushed; flushing happens once
/// per attempt and leaves the queue permanently empty.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: Vec<IceCandidate>,
    flushed: bool,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a candidate; returns false when the queue was already flushed
    pub fn push(&mut self, candidate: IceCandidate) -> bool {
        if self.flushed {
            return false;
        }
        self.pending.push(candidate);
        true
    }

    /// Take every queued candidate; subsequent calls return nothing
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.flushed = true;
        std::mem::take(&mut self.pending)
    }
}

/// Build an SDP fragment carrying `candidates`
///
/// Candidates are grouped by m-line index and emitted in the media order of
/// the offer. Candidates without an index belong to the first (bundled)
/// media section.
pub fn generate_sdp_fragment(offer: &OfferData, candidates: &[IceCandidate]) -> String {
    let mut by_media: BTreeMap<u16, Vec<&IceCandidate>> = BTreeMap::new();
    for candidate in candidates {
        let index = candidate.sdp_mline_index.unwrap_or(0);
        by_media.entry(index).or_default().push(candidate);
    }

    let mut frag = format!(
        "a=ice-ufrag:{}\r\na=ice-pwd:{}\r\n",
        offer.ice_ufrag, offer.ice_pwd
    );

    for (mid, media) in offer.medias.iter().enumerate() {
        let Some(list) = u16::try_from(mid).ok().and_then(|mid| by_media.get(&mid)) else {
            continue;
        };

        frag.push_str(&format!("m={}\r\na=mid:{}\r\n", media, mid));
        for candidate in list {
            frag.push_str(&format!("a={}\r\n", candidate.candidate));
        }
    }

    frag
}
