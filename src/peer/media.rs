//! Local capture tracks and received remote tracks

use crate::error::{Error, Result};
use crate::peer::types::{MediaConstraints, TrackKind};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Media capture runtime (camera / microphone access)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Vec<LocalTrack>>;
}

/// A captured track owned by the broadcaster.
///
/// Cloning shares the underlying track; `stop()` on any clone stops all.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let capability = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.into(),
                stream_id.into(),
            )),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn stream_id(&self) -> &str {
        self.track.stream_id()
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Returns true if this call ended the track
    pub fn stop(&self) -> bool {
        let was_live = self.live.swap(false, Ordering::SeqCst);
        if was_live {
            debug!("Stopped local {:?} track {}", self.kind, self.id());
        }
        was_live
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Push one encoded frame to every peer the track is attached to
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_live() {
            return Err(Error::MediaAccess(format!("track {} is stopped", self.id())));
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await
            .map_err(|e| Error::MediaAccess(e.to_string()))
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// A track received from the broadcaster, handed to the UI for rendering
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    stream_id: String,
    kind: TrackKind,
    rtp: Option<Arc<TrackRemote>>,
    live: Arc<AtomicBool>,
}

impl RemoteTrack {
    /// A track without an RTP source (runtimes that render elsewhere)
    pub fn new(id: impl Into<String>, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            stream_id: stream_id.into(),
            kind,
            rtp: None,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn from_rtc(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind,
            rtp: Some(track),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// RTP source to read packets from, when backed by webrtc-rs
    pub fn rtp(&self) -> Option<&Arc<TrackRemote>> {
        self.rtp.as_ref()
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Tells renderers to let go of the track
    pub fn stop(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Capture runtime whose tracks are fed by the application.
///
/// The encoder pipeline pushes frames through [`LocalTrack::write_sample`];
/// this type only decides which devices exist.
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    has_camera: bool,
    has_microphone: bool,
}

impl Default for SampleTrackDevices {
    fn default() -> Self {
        Self {
            has_camera: true,
            has_microphone: true,
        }
    }
}

impl SampleTrackDevices {
    pub fn new(has_camera: bool, has_microphone: bool) -> Self {
        Self {
            has_camera,
            has_microphone,
        }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Vec<LocalTrack>> {
        if !constraints.video {
            return Err(Error::MediaAccess("video is required".into()));
        }
        if !self.has_camera {
            return Err(Error::MediaAccess("no camera available".into()));
        }

        let stream_id = format!("cast-{}", random_id());
        let mut tracks = vec![LocalTrack::new(
            TrackKind::Video,
            format!("video-{}", random_id()),
            stream_id.clone(),
        )];
        if constraints.audio {
            if self.has_microphone {
                tracks.push(LocalTrack::new(
                    TrackKind::Audio,
                    format!("audio-{}", random_id()),
                    stream_id.clone(),
                ));
            } else {
                // audio is optional; carry on with video only
                info!("No microphone available, broadcasting video only");
            }
        }
        Ok(tracks)
    }
}
