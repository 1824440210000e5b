pub mod connection;
pub mod ice;
pub mod media;
pub mod runtime;
pub mod types;

pub use connection::{RtcPeer, RtcPeerFactory};
pub use ice::{apply_candidates, CandidateQueue};
pub use media::{LocalTrack, MediaDevices, RemoteTrack, SampleTrackDevices};
pub use runtime::{PeerConnection, PeerFactory};
pub use types::{ConnectionState, MediaConstraints, PeerEvent, PeerEventSink, TrackKind};
