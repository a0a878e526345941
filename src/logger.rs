use crate::error::NegotiationError;
use crate::peer::adapter::RemoteTrack;
use crate::peer::types::IceCandidate;
use crate::session::{SessionEvent, SessionId, SessionState};
use log::{debug, info, warn, LevelFilter};
use std::io::Write;
use tokio::sync::mpsc;

/// Уровень по умолчанию, если RUST_LOG не задан
fn default_level() -> LevelFilter {
    // Проверяем конфигурацию логирования
    if crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING {
        LevelFilter::Debug
    } else {
        LevelFilter::Off
    }
}

/// Логирование с временными метками. Повторный вызов ничего не делает.
pub fn init() {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level());
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.format(|buf, record| {
        let now = chrono::Local::now();
        writeln!(
            buf,
            "RUST: [{}] {} {} {}",
            now.format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });
    let _ = builder.try_init();
}

/// Печать ICE-candidate при появлении
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index, cand.username_fragment
    );
}

/// Отправка событий сессии владельцу. Закрытый получатель не ошибка.
#[derive(Debug, Clone)]
pub struct Emitter {
    session: SessionId,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Emitter {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("[{}] event receiver dropped", self.session);
        }
    }

    pub fn state_changed(&self, from: SessionState, to: SessionState) {
        info!("[{}] {from} -> {to}", self.session);
        self.emit(SessionEvent::StateChanged { from, to });
    }

    pub fn peer_named(&self, name: &str) {
        info!("[{}] remote peer is {name}", self.session);
        self.emit(SessionEvent::PeerNamed(name.to_string()));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        info!(
            "[{}] remote {:?} track {} (stream {})",
            self.session, track.kind, track.id, track.stream_id
        );
        self.emit(SessionEvent::RemoteTrack(track));
    }

    pub fn candidate_rejected(&self, candidate: &str, reason: &str) {
        warn!("[{}] candidate rejected: {reason}: {candidate}", self.session);
        self.emit(SessionEvent::CandidateRejected {
            candidate: candidate.to_string(),
            reason: reason.to_string(),
        });
    }

    pub fn terminated(&self, state: SessionState, error: Option<NegotiationError>) {
        match &error {
            Some(e) => warn!("[{}] terminated in {state}: {e}", self.session),
            None => info!("[{}] terminated in {state}", self.session),
        }
        self.emit(SessionEvent::Terminated { state, error });
    }
}
