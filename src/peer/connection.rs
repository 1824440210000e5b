use crate::config::CastConfig;
use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::peer::media::{LocalTrack, RemoteTrack};
use crate::peer::runtime::{PeerConnection, PeerFactory};
use crate::peer::types::{ConnectionState, PeerEvent, PeerEventSink, TrackKind};
use crate::signaling::types::{CandidateJson, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::TrackLocal;

/// Peer runtime backed by webrtc-rs
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    config: CastConfig,
}

impl RtcPeerFactory {
    pub fn new(config: CastConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.config.rtc_ice_servers(),
            ice_candidate_pool_size: 10,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        }
    }
}

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| Error::Negotiation(format!("failed to register codecs: {e}")))?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(|e| Error::Negotiation(format!("failed to register interceptors: {e}")))?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_peer(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let api = build_api()?;
        let pc = Arc::new(api.new_peer_connection(self.rtc_config()).await?);
        info!("Created peer connection for link {}", events.link_id());

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    // None marks the end of gathering
                    debug!("{}: candidate gathering completed", sink.link_id());
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let candidate = CandidateJson::from(init);
                        dump_candidate(sink.link_id(), &candidate);
                        sink.emit(PeerEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!("{}: cannot serialize local candidate: {}", sink.link_id(), e),
                }
            })
        }));

        let link = events.link_id().to_string();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("{}: ICE gathering state changed to {:?}", link, state);
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("{}: peer connection state changed to {:?}", sink.link_id(), st);
            sink.emit(PeerEvent::StateChanged(ConnectionState::from(st)));
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = RemoteTrack::from_rtc(track);
            info!(
                "{}: received remote {:?} track {}",
                sink.link_id(),
                remote.kind(),
                remote.id()
            );
            sink.emit(PeerEvent::RemoteTrack(remote));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeer { pc }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .pc
            .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for interceptors (NACK, reports) to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn add_receiver(&self, kind: TrackKind) -> Result<()> {
        self.pc
            .add_transceiver_from_kind(
                kind.into(),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        SessionDescription::from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        SessionDescription::from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_local_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<()> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateJson) -> Result<()> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
