use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub type UserId = String;
pub type ViewerId = String;

/// `{ type, sdp }` as written into the channel document
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "offer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: "answer".into(),
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == "offer"
    }

    pub fn is_answer(&self) -> bool {
        self.sdp_type == "answer"
    }

    /// Parses the payload; anything but a well-formed offer/answer is a negotiation error
    pub fn to_rtc(&self) -> Result<RTCSessionDescription> {
        let desc = match self.sdp_type.as_str() {
            "offer" => RTCSessionDescription::offer(self.sdp.clone()),
            "answer" => RTCSessionDescription::answer(self.sdp.clone()),
            other => {
                return Err(Error::Negotiation(format!(
                    "unexpected session description type {other:?}"
                )))
            }
        };
        desc.map_err(|e| Error::Negotiation(format!("malformed {}: {e}", self.sdp_type)))
    }

    pub fn from_rtc(desc: &RTCSessionDescription) -> Result<Self> {
        match desc.sdp_type {
            RTCSdpType::Offer | RTCSdpType::Answer => Ok(Self {
                sdp_type: desc.sdp_type.to_string(),
                sdp: desc.sdp.clone(),
            }),
            other => Err(Error::Negotiation(format!(
                "unsupported local description type {other}"
            ))),
        }
    }
}

/// Opaque serialized connectivity candidate, transported verbatim
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct CandidateJson {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl CandidateJson {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// `host`, `srflx`, `prflx` or `relay`, read from the `typ` token
    pub fn kind(&self) -> Option<&str> {
        let mut tokens = self.candidate.split_whitespace();
        while let Some(token) = tokens.next() {
            if token == "typ" {
                return tokens.next();
            }
        }
        None
    }
}

impl From<RTCIceCandidateInit> for CandidateJson {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateJson> for RTCIceCandidateInit {
    fn from(c: CandidateJson) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Per-viewer negotiation record, created by the viewer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub viewer_candidates: Vec<CandidateJson>,
    #[serde(default)]
    pub streamer_candidates: Vec<CandidateJson>,
}

impl PeerRecord {
    /// Offer present, answer still missing
    pub fn awaiting_answer(&self) -> bool {
        self.offer.is_some() && self.answer.is_none()
    }
}

/// Which side of a [`PeerRecord`] a candidate belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Viewer,
    Streamer,
}

/// The per-channel signaling document
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStreamState {
    #[serde(default)]
    pub current_streamer: Option<UserId>,
    #[serde(default)]
    pub connections: BTreeMap<ViewerId, PeerRecord>,
}

impl ChannelStreamState {
    pub fn is_live(&self) -> bool {
        self.current_streamer.is_some()
    }

    pub fn record(&self, viewer: &str) -> Option<&PeerRecord> {
        self.connections.get(viewer)
    }

    /// Merge a partial update the way the document store does.
    ///
    /// Only `PutOffer` creates a record. Answers and candidates aimed at a
    /// record that no longer exists are dropped; returns whether anything changed.
    pub fn apply(&mut self, update: &StateUpdate) -> bool {
        match update {
            StateUpdate::PutOffer { viewer, offer } => {
                self.connections.insert(
                    viewer.clone(),
                    PeerRecord {
                        offer: Some(offer.clone()),
                        ..Default::default()
                    },
                );
            }
            StateUpdate::PutAnswer { viewer, answer } => {
                let Some(record) = self.connections.get_mut(viewer) else {
                    return false;
                };
                record.answer = Some(answer.clone());
            }
            StateUpdate::AppendCandidate {
                viewer,
                origin,
                candidate,
            } => {
                let Some(record) = self.connections.get_mut(viewer) else {
                    return false;
                };
                match origin {
                    CandidateOrigin::Viewer => record.viewer_candidates.push(candidate.clone()),
                    CandidateOrigin::Streamer => record.streamer_candidates.push(candidate.clone()),
                }
            }
        }
        true
    }

    /// Claim/release semantics: swap the streamer and drop every record
    pub fn reset(&mut self, streamer: Option<UserId>) {
        self.current_streamer = streamer;
        self.connections.clear();
    }
}

/// Field-level writes a session makes into the channel document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// `connections[viewer] = { offer, answer: null, viewerCandidates: [], streamerCandidates: [] }`
    PutOffer {
        viewer: ViewerId,
        offer: SessionDescription,
    },
    /// `connections[viewer].answer = answer`
    PutAnswer {
        viewer: ViewerId,
        answer: SessionDescription,
    },
    /// Append to `viewerCandidates` or `streamerCandidates`
    AppendCandidate {
        viewer: ViewerId,
        origin: CandidateOrigin,
        candidate: CandidateJson,
    },
}
