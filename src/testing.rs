//! Тестовые заглушки: адаптер без сети, неработающая камера, журналируемый канал.

use crate::error::NegotiationError;
use crate::negotiation::Collaborators;
use crate::peer::adapter::{AdapterEvent, AdapterEvents, LocalTrack, PeerConnectionAdapter, RemoteTrack};
use crate::peer::connection::WebRtcAdapter;
use crate::peer::ice::StaticIceServers;
use crate::peer::media::{MediaSource, SyntheticCapture};
use crate::peer::types::{IceCandidate, IceServer, MediaKind, SessionDescription};
use crate::retry::RetryScheduler;
use crate::session::Role;
use crate::signaling::{EventKind, LocalRelay, SignalingChannel, Subscription};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Общий журнал действий адаптера и канала
pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

pub(crate) fn host_candidate(n: u8) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"
    ))
}

pub(crate) fn wire(candidates: &[IceCandidate]) -> Vec<String> {
    candidates.iter().map(|c| c.to_wire().unwrap()).collect()
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub closed: bool,
    pub configured_with: Option<Vec<IceServer>>,
    pub tracks: usize,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub remote_commits: usize,
    pub applied: Vec<IceCandidate>,
    pub rejected: Vec<IceCandidate>,
}

/// Адаптер без транспорта. После commit_local выдаёт заданные кандидаты и
/// DiscoveryComplete; кандидаты со словом "bad" отклоняются.
pub(crate) struct MockAdapter {
    pub state: Mutex<MockState>,
    local_candidates: Vec<IceCandidate>,
    journal: Option<Journal>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<AdapterEvents>>,
}

impl MockAdapter {
    pub(crate) fn new(local_candidates: Vec<IceCandidate>) -> Arc<Self> {
        Self::build(local_candidates, None)
    }

    pub(crate) fn with_journal(local_candidates: Vec<IceCandidate>, journal: Journal) -> Arc<Self> {
        Self::build(local_candidates, Some(journal))
    }

    fn build(local_candidates: Vec<IceCandidate>, journal: Option<Journal>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(MockState::default()),
            local_candidates,
            journal,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn record(&self, entry: impl Into<String>) {
        if let Some(journal) = &self.journal {
            journal.lock().push(entry.into());
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.state.lock().closed {
            return Err(NegotiationError::AdapterClosed);
        }
        Ok(())
    }

    pub(crate) fn remote_commits(&self) -> usize {
        self.state.lock().remote_commits
    }

    pub(crate) fn applied(&self) -> usize {
        self.state.lock().applied.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl PeerConnectionAdapter for MockAdapter {
    fn subscribe(&self) -> Result<AdapterEvents, NegotiationError> {
        self.ensure_open()?;
        self.events_rx
            .lock()
            .take()
            .ok_or_else(|| NegotiationError::Adapter("adapter events already claimed".into()))
    }

    async fn configure(&self, ice_servers: &[IceServer]) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.state.lock().configured_with = Some(ice_servers.to_vec());
        Ok(())
    }

    async fn attach_local_track(&self, _track: LocalTrack) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.state.lock().tracks += 1;
        Ok(())
    }

    async fn create_local_description(
        &self,
        role: Role,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        match role {
            Role::Host => Ok(SessionDescription::offer("v=0 mock-offer")),
            Role::Joiner => {
                if self.state.lock().remote.is_none() {
                    return Err(NegotiationError::Adapter(
                        "answer requires a committed remote offer".into(),
                    ));
                }
                Ok(SessionDescription::answer("v=0 mock-answer"))
            }
        }
    }

    async fn commit_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.state.lock().local = Some(desc.clone());
        self.record("adapter:commit-local");
        for candidate in &self.local_candidates {
            let _ = self
                .events_tx
                .send(AdapterEvent::CandidateDiscovered(candidate.clone()));
        }
        let _ = self.events_tx.send(AdapterEvent::DiscoveryComplete);
        Ok(())
    }

    async fn commit_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.remote_commits += 1;
        match &state.remote {
            Some(existing) if existing == desc => return Ok(()),
            Some(_) => return Err(NegotiationError::AlreadyCommitted),
            None => {}
        }
        state.remote = Some(desc.clone());
        drop(state);
        self.record("adapter:commit-remote");

        let _ = self.events_tx.send(AdapterEvent::RemoteTrack(RemoteTrack {
            id: "remote-video".into(),
            stream_id: "remote".into(),
            kind: MediaKind::Video,
            track: None,
        }));
        Ok(())
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(NegotiationError::Adapter(
                "candidate applied before remote description".into(),
            ));
        }
        if candidate.candidate.contains("bad") {
            state.rejected.push(candidate.clone());
            return Err(NegotiationError::CandidateApplication {
                candidate: candidate.candidate.clone(),
                reason: "malformed candidate".into(),
            });
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.state.lock().closed = true;
        self.record("adapter:close");
        Ok(())
    }
}

/// Камера недоступна
pub(crate) struct FailingMedia;

#[async_trait]
impl MediaSource for FailingMedia {
    async fn acquire(&self) -> Result<Vec<LocalTrack>, NegotiationError> {
        Err(NegotiationError::MediaAccess("permission denied".into()))
    }
}

/// Канал, записывающий отправки в журнал
pub(crate) struct RecordingChannel<C> {
    inner: C,
    journal: Journal,
}

impl<C> RecordingChannel<C> {
    pub(crate) fn new(inner: C, journal: Journal) -> Self {
        Self { inner, journal }
    }
}

#[async_trait]
impl<C: SignalingChannel> SignalingChannel for RecordingChannel<C> {
    async fn connect(&self) -> Result<(), NegotiationError> {
        self.inner.connect().await
    }

    async fn send(&self, kind: EventKind, payload: Value) -> Result<(), NegotiationError> {
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        self.journal
            .lock()
            .push(format!("channel:send:{kind}:{candidates}"));
        self.inner.send(kind, payload).await
    }

    fn subscribe(&self, kind: EventKind) -> Result<Subscription, NegotiationError> {
        self.inner.subscribe(kind)
    }

    async fn disconnect(&self) -> Result<(), NegotiationError> {
        self.inner.disconnect().await
    }
}

/// Участник на LocalRelay с заглушкой адаптера
pub(crate) fn collaborators(
    relay: &LocalRelay,
    adapter: Arc<MockAdapter>,
    retry: RetryScheduler,
) -> Collaborators {
    Collaborators {
        adapter,
        channel: Arc::new(relay.channel()),
        rooms: Arc::new(relay.clone()),
        media: Arc::new(SyntheticCapture::new(true, true)),
        ice: Arc::new(StaticIceServers::defaults()),
        retry,
    }
}

/// Участник на LocalRelay с настоящим WebRtcAdapter. STUN недоступен,
/// поэтому собираются только host кандидаты.
pub(crate) fn webrtc_collaborators(relay: &LocalRelay) -> Collaborators {
    Collaborators {
        adapter: Arc::new(WebRtcAdapter::new(false).unwrap()),
        channel: Arc::new(relay.channel()),
        rooms: Arc::new(relay.clone()),
        media: Arc::new(SyntheticCapture::new(true, true)),
        ice: Arc::new(StaticIceServers::new(vec![IceServer::stun(&[
            "stun:127.0.0.1:9",
        ])])),
        retry: RetryScheduler::new(),
    }
}
