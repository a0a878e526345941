use crate::session::SessionState;
use thiserror::Error;

/// Классификация ошибок согласования.
///
/// Все ошибки, кроме `CandidateApplication`, фатальны для сессии.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("media access failed: {0}")]
    MediaAccess(String),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("negotiation timed out after {attempts} empty candidate responses")]
    NegotiationTimeout { attempts: u32 },

    #[error("candidate {candidate:?} could not be applied: {reason}")]
    CandidateApplication { candidate: String, reason: String },

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("remote description already committed with different content")]
    AlreadyCommitted,

    #[error("peer connection adapter is closed")]
    AdapterClosed,

    #[error("peer connection error: {0}")]
    Adapter(String),

    #[error("malformed signaling payload: {0}")]
    Protocol(String),

    #[error("room service request failed: {0}")]
    RoomService(String),

    #[error("ice server provisioning failed: {0}")]
    Provisioning(String),

    #[error("candidate buffer misuse: {0}")]
    Buffer(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("session already started")]
    AlreadyStarted,

    #[error("session is {state}, operation rejected")]
    SessionTerminated { state: SessionState },

    #[error("invalid state transition {from} -> {to}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

impl NegotiationError {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NegotiationError::CandidateApplication { .. })
    }

    /// Короткое имя вида ошибки для логов и событий.
    pub fn kind(&self) -> &'static str {
        match self {
            NegotiationError::MediaAccess(_) => "MediaAccessError",
            NegotiationError::SignalingUnavailable(_) => "SignalingUnavailable",
            NegotiationError::NegotiationTimeout { .. } => "NegotiationTimeout",
            NegotiationError::CandidateApplication { .. } => "CandidateApplicationError",
            NegotiationError::RoomNotFound(_) => "RoomNotFound",
            NegotiationError::AlreadyCommitted => "AlreadyCommitted",
            NegotiationError::AdapterClosed => "AdapterClosed",
            NegotiationError::Adapter(_) => "AdapterError",
            NegotiationError::Protocol(_) => "ProtocolError",
            NegotiationError::RoomService(_) => "RoomServiceError",
            NegotiationError::Provisioning(_) => "ProvisioningError",
            NegotiationError::Buffer(_) => "CandidateBufferError",
            NegotiationError::Config(_) => "ConfigError",
            NegotiationError::AlreadyStarted => "AlreadyStarted",
            NegotiationError::SessionTerminated { .. } => "SessionTerminated",
            NegotiationError::InvalidTransition { .. } => "InvalidTransition",
        }
    }
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        NegotiationError::Adapter(err.to_string())
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Protocol(err.to_string())
    }
}
