//! WebRTC receive side
//!
//! Architecture:
//! ```text
//! WebRtcReader (supervisor task)
//!        |
//!        +-- probe ------> throwaway transports (codec capability)
//!        |
//!        +-- whep -------> OPTIONS / POST / PATCH / DELETE
//!        |
//!        +-- sdp, trickle  (offer editing, candidate fragments)
//!        |
//!        v
//! PeerTransport (webrtc-rs in peer.rs)
//!        |
//!        v
//! EventBus <- Track / Ready / Error
//! ```

pub mod codec;
pub mod config;
pub mod peer;
pub mod probe;
pub mod reader;
pub mod sdp;
pub mod signaling;
pub mod transport;
pub mod trickle;
pub mod whep;

pub use codec::{CodecSet, NonAdvertisedCodec};
pub use config::IceServer;
pub use peer::{WebRtcTransport, WebRtcTransportFactory};
pub use reader::{ReaderState, WebRtcReader};
pub use signaling::{ConnectionState, IceCandidate, IceConnectionState, MediaKind};
pub use transport::{PeerTransport, ReceivedTrack, TrackInfo, TransportEvent, TransportFactory};
pub use whep::WhepClient;
