use crate::error::NegotiationError;
use crate::peer::adapter::{AdapterEvent, AdapterEvents, LocalTrack, PeerConnectionAdapter, RemoteTrack};
use crate::peer::types::{IceCandidate, IceServer, SdpKind, SessionDescription};
use crate::session::Role;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Адаптер поверх webrtc-rs: один RTCPeerConnection на сессию
pub struct WebRtcAdapter {
    api: API,
    relay_only: bool,
    peer: Mutex<Option<Arc<RTCPeerConnection>>>,
    remote: Mutex<Option<SessionDescription>>,
    closed: AtomicBool,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<AdapterEvents>>,
}

impl WebRtcAdapter {
    pub fn new(relay_only: bool) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            api,
            relay_only,
            peer: Mutex::new(None),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    fn peer(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::AdapterClosed);
        }
        self.peer
            .lock()
            .clone()
            .ok_or_else(|| NegotiationError::Adapter("peer connection is not configured".into()))
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::AdapterClosed);
        }
        Ok(())
    }

    /// Подписывает колбэки peer connection на поток AdapterEvent
    fn wire_callbacks(&self, pc: &Arc<RTCPeerConnection>) {
        let tx = self.events_tx.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let _ = tx.send(AdapterEvent::CandidateDiscovered(init.into()));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {e}"),
                    },
                    // cand == None означает конец сбора
                    None => {
                        let _ = tx.send(AdapterEvent::DiscoveryComplete);
                    }
                }
            })
        }));

        let tx = self.events_tx.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = tx.send(AdapterEvent::RemoteTrack(RemoteTrack::from(track)));
                Box::pin(async {})
            },
        ));

        let tx = self.events_tx.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            let _ = tx.send(AdapterEvent::SignalingStateChanged(state.to_string()));
            Box::pin(async {})
        }));

        let tx = self.events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(AdapterEvent::ConnectionStateChanged(state.to_string()));
            Box::pin(async {})
        }));
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(ice_servers: &[IceServer], relay_only: bool) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
        ice_transport_policy: if relay_only {
            RTCIceTransportPolicy::Relay
        } else {
            RTCIceTransportPolicy::All
        },
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.body.clone())?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.body.clone())?,
    };
    Ok(rtc)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        other => {
            return Err(NegotiationError::Adapter(format!(
                "unexpected local description type {other}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        body: desc.sdp,
    })
}

#[async_trait]
impl PeerConnectionAdapter for WebRtcAdapter {
    fn subscribe(&self) -> Result<AdapterEvents, NegotiationError> {
        self.ensure_open()?;
        self.events_rx
            .lock()
            .take()
            .ok_or_else(|| NegotiationError::Adapter("adapter events already claimed".into()))
    }

    async fn configure(&self, ice_servers: &[IceServer]) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.peer.lock().is_some() {
            return Err(NegotiationError::Adapter(
                "peer connection already configured".into(),
            ));
        }

        let config = rtc_config(ice_servers, self.relay_only);
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        self.wire_callbacks(&pc);
        *self.peer.lock() = Some(pc);
        info!(
            "Peer connection created with {} ICE server entries (relay_only={})",
            ice_servers.len(),
            self.relay_only
        );
        Ok(())
    }

    async fn attach_local_track(&self, track: LocalTrack) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        let sender = pc
            .add_track(track.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        debug!("Attached local {:?} track {}", track.kind, track.id());

        // RTCP надо вычитывать, иначе interceptors не работают
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = sender.read(&mut rtcp_buf).await {}
        });
        Ok(())
    }

    async fn create_local_description(
        &self,
        role: Role,
    ) -> Result<SessionDescription, NegotiationError> {
        let pc = self.peer()?;
        let desc = match role {
            Role::Host => pc.create_offer(None).await?,
            Role::Joiner => {
                if pc.remote_description().await.is_none() {
                    return Err(NegotiationError::Adapter(
                        "answer requires a committed remote offer".into(),
                    ));
                }
                pc.create_answer(None).await?
            }
        };
        from_rtc(desc)
    }

    async fn commit_local_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn commit_remote_description(
        &self,
        desc: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        {
            let remote = self.remote.lock();
            match remote.as_ref() {
                Some(existing) if existing == desc => return Ok(()),
                Some(_) => return Err(NegotiationError::AlreadyCommitted),
                None => {}
            }
        }
        pc.set_remote_description(to_rtc(desc)?).await?;
        *self.remote.lock() = Some(desc.clone());
        Ok(())
    }

    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let pc = self.peer()?;
        pc.add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await
            .map_err(|e| NegotiationError::CandidateApplication {
                candidate: candidate.candidate.clone(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let pc = self.peer.lock().take();
        if let Some(pc) = pc {
            pc.close().await?;
            info!("Peer connection closed");
        }
        Ok(())
    }
}
