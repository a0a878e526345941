use crate::error::NegotiationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Тип описания сессии
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl fmt::Display for SdpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// Описание сессии (SDP) без интерпретации содержимого.
///
/// Браузерные участники присылают `sdp` вместо `body`, поэтому поле принимает оба имени.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(alias = "sdp")]
    pub body: String,
}

impl SessionDescription {
    pub fn offer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            body: body.into(),
        }
    }

    pub fn answer(body: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            body: body.into(),
        }
    }
}

/// ICE кандидат. На проводе передаётся как JSON-строка.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    /// Стабильная строковая форма для транспорта
    pub fn to_wire(&self) -> Result<String, NegotiationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_wire(raw: &str) -> Result<Self, NegotiationError> {
        serde_json::from_str(raw).map_err(|e| NegotiationError::CandidateApplication {
            candidate: raw.to_string(),
            reason: format!("unparseable candidate: {}", e),
        })
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<&IceCandidate> for RTCIceCandidateInit {
    fn from(c: &IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate.clone(),
            sdp_mid: c.sdp_mid.clone(),
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment.clone(),
        }
    }
}

/// ICE сервер (STUN/TURN) в формате провайдера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: None,
            credential: None,
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Конфигурация ICE сервера, заданная пользователем
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), NegotiationError> {
        if self.url.is_empty() {
            return Err(NegotiationError::Config(format!(
                "ice server {} has an empty url",
                self.id
            )));
        }
        if self.r#type == "turn" && (self.username.is_none() || self.credential.is_none()) {
            return Err(NegotiationError::Config(format!(
                "turn server {} requires username and credential",
                self.id
            )));
        }
        Ok(())
    }
}

/// Вид медиа-трека
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for MediaKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }
}
