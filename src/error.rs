//! Error types for the broadcast signaling core

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification the UI layer dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MediaAccess,
    StreamBusy,
    Negotiation,
    Transport,
    Config,
}

/// Errors surfaced at the session boundary
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local capture device unavailable or denied
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Another user is already broadcasting on the channel
    #[error("Channel {channel_id} is busy: {streamer} is already streaming")]
    StreamBusy { channel_id: String, streamer: String },

    /// Malformed or unexpected offer/answer, or SDP application failure
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Signaling document read or write failure
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// Invalid discovery-server configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MediaAccess(_) => ErrorKind::MediaAccess,
            Error::StreamBusy { .. } => ErrorKind::StreamBusy,
            Error::Negotiation(_) => ErrorKind::Negotiation,
            Error::Transport(_) => ErrorKind::Transport,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Negotiation(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let busy = Error::StreamBusy {
            channel_id: "general".into(),
            streamer: "bob".into(),
        };
        assert_eq!(busy.kind(), ErrorKind::StreamBusy);
        assert!(busy.to_string().contains("bob"));
        assert_eq!(
            Error::Transport("offline".into()).kind(),
            ErrorKind::Transport
        );
    }

    #[test]
    fn test_webrtc_error_is_negotiation() {
        let err: Error = webrtc::Error::ErrConnectionClosed.into();
        assert_eq!(err.kind(), ErrorKind::Negotiation);
    }
}
