use crate::error::Result;
use crate::peer::media::LocalTrack;
use crate::peer::types::{PeerEventSink, TrackKind};
use crate::signaling::types::{CandidateJson, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;

/// One peer connection as seen by the signaling sessions.
///
/// Candidate, track and state callbacks go to the [`PeerEventSink`] the
/// connection was created with.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach a local capture track (broadcaster side)
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Ask to receive a track of this kind without sending one (viewer side)
    async fn add_receiver(&self, kind: TrackKind) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: CandidateJson) -> Result<()>;

    /// Must tolerate being called on an already closed connection
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>>;
}
