use crate::error::NegotiationError;
use crate::peer::types::{IceCandidate, IceServer, MediaKind, SessionDescription};
use crate::session::Role;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Локальный трек, захваченный MediaSource
#[derive(Clone)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn id(&self) -> &str {
        self.track.id()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.track.id())
            .field("stream_id", &self.track.stream_id())
            .finish()
    }
}

/// Удалённый трек, пришедший от собеседника
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// None у адаптеров без реального транспорта (тесты)
    pub track: Option<Arc<TrackRemote>>,
}

impl From<Arc<TrackRemote>> for RemoteTrack {
    fn from(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            stream_id: track.stream_id(),
            kind: MediaKind::from(track.kind()),
            track: Some(track),
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Асинхронные события peer connection
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    CandidateDiscovered(IceCandidate),
    /// Сбор кандидатов завершён (null candidate)
    DiscoveryComplete,
    RemoteTrack(RemoteTrack),
    SignalingStateChanged(String),
    ConnectionStateChanged(String),
}

pub type AdapterEvents = mpsc::UnboundedReceiver<AdapterEvent>;

/// Примитив согласования, которым управляет машина состояний.
///
/// После `close()` все операции, кроме самого `close()`, возвращают `AdapterClosed`.
#[async_trait]
pub trait PeerConnectionAdapter: Send + Sync {
    /// Поток событий; забирается один раз за время жизни адаптера.
    fn subscribe(&self) -> Result<AdapterEvents, NegotiationError>;

    async fn configure(&self, ice_servers: &[IceServer]) -> Result<(), NegotiationError>;

    async fn attach_local_track(&self, track: LocalTrack) -> Result<(), NegotiationError>;

    /// Offer для Host; Answer для Joiner, только после commit_remote_description.
    async fn create_local_description(
        &self,
        role: Role,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn commit_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// Повторный вызов с другим содержимым -> `AlreadyCommitted`.
    async fn commit_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}
