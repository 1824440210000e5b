use crate::signaling::types::CandidateJson;
use crate::peer::media::RemoteTrack;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl From<TrackKind> for RTPCodecType {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Video => RTPCodecType::Video,
            TrackKind::Audio => RTPCodecType::Audio,
        }
    }
}

/// Requested capture devices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

/// Peer connection lifecycle as reported to sessions.
///
/// `Failed` is terminal: nothing retries, the owner decides whether to rejoin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Callbacks from a peer connection, delivered into the owning session's queue
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(CandidateJson),
    RemoteTrack(RemoteTrack),
    StateChanged(ConnectionState),
}

/// Tagged sender handed to the peer runtime when a connection is created.
///
/// The tag (`link_id`) lets a session route events from several peer
/// connections through one queue and ignore events from links it already
/// dropped.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    link_id: String,
    tx: mpsc::UnboundedSender<(String, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(link_id: impl Into<String>, tx: mpsc::UnboundedSender<(String, PeerEvent)>) -> Self {
        Self {
            link_id: link_id.into(),
            tx,
        }
    }

    pub fn link_id(&self) -> &str {
        &self.link_id
    }

    /// Returns false once the owning session has gone away
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx.send((self.link_id.clone(), event)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Disconnected.is_terminal());
    }

    #[test]
    fn test_sink_tags_events_and_detects_closed_queue() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new("link-1", tx);
        assert!(sink.emit(PeerEvent::StateChanged(ConnectionState::Connecting)));

        let (tag, event) = rx.try_recv().unwrap();
        assert_eq!(tag, "link-1");
        assert!(matches!(
            event,
            PeerEvent::StateChanged(ConnectionState::Connecting)
        ));

        drop(rx);
        assert!(!sink.emit(PeerEvent::StateChanged(ConnectionState::Closed)));
    }
}
