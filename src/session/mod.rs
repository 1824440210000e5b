//! Broadcaster and viewer sessions plus the per-channel coordinator

pub mod broadcast;
pub mod coordinator;
pub mod view;

pub use broadcast::BroadcastSession;
pub use coordinator::{CoordinatorState, SessionCoordinator};
pub use view::ViewSession;

use crate::config::CastConfig;
use crate::error::{Error, Result};
use crate::peer::{
    ConnectionState, MediaDevices, PeerConnection, PeerFactory, RemoteTrack, RtcPeerFactory,
    SampleTrackDevices,
};
use crate::signaling::{SignalingChannel, ViewerId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// External collaborators every session works through
#[derive(Clone)]
pub struct SessionContext {
    pub signaling: Arc<dyn SignalingChannel>,
    pub peers: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaDevices>,
    pub config: CastConfig,
}

impl SessionContext {
    pub fn new(
        signaling: Arc<dyn SignalingChannel>,
        peers: Arc<dyn PeerFactory>,
        media: Arc<dyn MediaDevices>,
        config: CastConfig,
    ) -> Self {
        Self {
            signaling,
            peers,
            media,
            config,
        }
    }

    /// webrtc-rs peer connections and application-fed capture tracks
    pub fn with_webrtc(signaling: Arc<dyn SignalingChannel>, config: CastConfig) -> Result<Self> {
        let peers = RtcPeerFactory::new(config.clone())?;
        Ok(Self::new(
            signaling,
            Arc::new(peers),
            Arc::new(SampleTrackDevices::default()),
            config,
        ))
    }
}

/// Notifications for the UI layer
#[derive(Debug)]
pub enum SessionEvent {
    /// Coordinator moved between Idle / Broadcasting / Viewing
    StateChanged(CoordinatorState),
    /// Render this track (viewer side)
    RemoteTrack(RemoteTrack),
    /// Viewer connection progress; `Failed` waits for an explicit rejoin
    ConnectionState(ConnectionState),
    /// Broadcaster gave up on one viewer; the stream goes on for the others
    ViewerDropped { viewer: ViewerId, error: Error },
    /// Failure while reacting to a snapshot
    Error(Error),
}

pub type EventTx = Option<mpsc::UnboundedSender<SessionEvent>>;

pub(crate) fn notify(tx: &EventTx, event: SessionEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Close a peer connection without letting its failure escape.
///
/// The close runs on its own task so even a panicking runtime call is
/// contained and logged.
pub(crate) async fn close_quietly(label: &str, peer: Arc<dyn PeerConnection>) {
    let closing = tokio::spawn(async move { peer.close().await });
    match closing.await {
        Ok(Ok(())) => debug!("{}: peer connection closed", label),
        Ok(Err(e)) => warn!("{}: error while closing peer connection: {}", label, e),
        Err(e) => error!("{}: peer connection close aborted: {}", label, e),
    }
}
