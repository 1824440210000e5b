//! Broadcast configuration: discovery servers and capture options

use crate::error::{Error, Result};
use crate::utils::add_ice_url_scheme;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// One discovery (or relay) server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_server_type")]
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

fn default_server_type() -> String {
    "stun".into()
}

impl ServerConfig {
    pub fn stun(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            r#type: default_server_type(),
            url,
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.r#type == "turn"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CastConfig {
    /// Servers used to gather local connectivity candidates
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<ServerConfig>,

    /// Capture (broadcaster) and receive (viewer) audio next to video
    #[serde(default)]
    pub audio: bool,
}

fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_STUN_SERVERS
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{i}"),
            ..ServerConfig::stun(*url)
        })
        .collect()
}

impl Default for CastConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            audio: false,
        }
    }
}

impl CastConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: CastConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(Error::Config("server URL cannot be empty".into()));
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::Config(format!(
                    "TURN server {} requires username and credential",
                    server.url
                )));
            }
        }
        Ok(())
    }

    /// Discovery servers in the shape the peer runtime expects
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        self.ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: vec![add_ice_url_scheme(server)],
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
            })
            .collect()
    }
}
