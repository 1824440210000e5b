//! Single-broadcaster live video for a chat channel.
//!
//! One user per channel claims the shared signaling document and streams
//! their camera; everyone else in the channel connects to them with a
//! receive-only peer connection negotiated through the same document.

pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{CastConfig, ServerConfig};
pub use error::{Error, ErrorKind, Result};
pub use peer::{
    ConnectionState, LocalTrack, MediaConstraints, MediaDevices, PeerConnection, PeerEvent,
    PeerEventSink, PeerFactory, RemoteTrack, TrackKind,
};
pub use session::{
    BroadcastSession, CoordinatorState, SessionContext, SessionCoordinator, SessionEvent,
    ViewSession,
};
pub use signaling::{
    CandidateJson, ChannelStreamState, MemorySignalingChannel, PeerRecord, SessionDescription,
    SignalingChannel, StateUpdate, Subscription,
};
