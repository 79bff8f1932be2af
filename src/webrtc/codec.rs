//! Audio codec configurations that transports support but do not advertise

use std::collections::BTreeSet;

/// Codec configuration the prober may enable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NonAdvertisedCodec {
    /// PCMA/PCMU stereo at 8 kHz
    PcmaStereo,
    /// Multichannel Opus (probed with the 5.1 layout)
    MultiOpus,
    /// Linear PCM 16-bit stereo
    L16Stereo,
}

impl NonAdvertisedCodec {
    pub const ALL: [NonAdvertisedCodec; 3] = [
        NonAdvertisedCodec::PcmaStereo,
        NonAdvertisedCodec::MultiOpus,
        NonAdvertisedCodec::L16Stereo,
    ];

    /// Codec identifier as written in an `a=rtpmap` line
    pub fn rtpmap(self) -> &'static str {
        match self {
            NonAdvertisedCodec::PcmaStereo => "pcma/8000/2",
            NonAdvertisedCodec::MultiOpus => "multiopus/48000/6",
            NonAdvertisedCodec::L16Stereo => "L16/48000/2",
        }
    }

    /// Format parameters required to probe the codec
    pub fn probe_fmtp(self) -> Option<&'static str> {
        match self {
            NonAdvertisedCodec::MultiOpus => {
                Some("channel_mapping=0,4,1,2,3,5;num_streams=4;coupled_streams=2")
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for NonAdvertisedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.rtpmap())
    }
}

/// Set of non-advertised codecs confirmed by the prober
///
/// Computed once per reader and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecSet(BTreeSet<NonAdvertisedCodec>);

impl CodecSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, codec: NonAdvertisedCodec) -> bool {
        self.0.contains(&codec)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = NonAdvertisedCodec> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<NonAdvertisedCodec> for CodecSet {
    fn from_iter<T: IntoIterator<Item = NonAdvertisedCodec>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl std::fmt::Display for CodecSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.iter().map(NonAdvertisedCodec::rtpmap).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
