//! Reader event types
//!
//! Notifications delivered to the host through the event bus.

use serde::Serialize;

use crate::webrtc::transport::{ReceivedTrack, TrackInfo};

/// Payload of the readiness notification
#[derive(Debug, Clone)]
pub struct ReadyInfo {
    /// Tracks delivering media when readiness was reached
    pub streams: Vec<ReceivedTrack>,
    /// Tracks received during the attempt
    pub track_count: usize,
}

impl ReadyInfo {
    /// Serializable summary of the ready streams
    pub fn summary(&self) -> ReadySummary {
        ReadySummary {
            streams: self.streams.iter().map(|t| t.info.clone()).collect(),
            track_count: self.track_count,
        }
    }
}

/// Track descriptions of a [`ReadyInfo`], without transport handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadySummary {
    pub streams: Vec<TrackInfo>,
    pub track_count: usize,
}

/// Notifications raised by a reader
#[derive(Debug, Clone)]
pub enum ReaderEvent {
    /// A remote track was received
    Track(ReceivedTrack),
    /// Media is flowing (at most once per attempt)
    Ready(ReadyInfo),
    /// Human-readable failure message
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::signaling::MediaKind;
    use crate::webrtc::transport::mock::track;

    #[test]
    fn test_ready_summary() {
        let info = ReadyInfo {
            streams: vec![track(MediaKind::Video, "v"), track(MediaKind::Audio, "a")],
            track_count: 2,
        };
        let summary = info.summary();
        assert_eq!(summary.track_count, 2);
        assert_eq!(summary.streams[0].id, "v");

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["streams"][1]["kind"], "audio");
    }
}
