pub mod config;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod retry;
pub mod room;
pub mod session;
pub mod signaling;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Config, NegotiationConfig};
pub use error::NegotiationError;
pub use negotiation::{Collaborators, NegotiationStateMachine, SessionHandle, SessionInput};
pub use retry::RetryScheduler;
pub use room::{HttpRoomRepository, RoomInfo, RoomRepository};
pub use session::{Role, Session, SessionEvent, SessionId, SessionReport, SessionState};
pub use signaling::{EventKind, SignalingChannel, WsSignalingChannel};

use log::{error, info};
use peer::{IceServerProvider, StaticIceServers, SyntheticCapture, WebRtcAdapter, XirsysProvider};
use std::sync::Arc;

/// Что делает этот запуск
#[derive(Debug, Clone)]
pub enum Command {
    Host { password: String },
    Join { room_id: String, password: String },
}

fn ice_provider(config: &Config) -> Result<Arc<dyn IceServerProvider>, NegotiationError> {
    if !config.ice_servers.is_empty() {
        return Ok(Arc::new(StaticIceServers::from_server_configs(
            &config.ice_servers,
        )?));
    }
    Ok(match &config.turn {
        Some(turn) => Arc::new(XirsysProvider::new(
            &turn.app_name,
            turn.user.clone(),
            turn.api_key.clone(),
        )),
        None => Arc::new(StaticIceServers::defaults()),
    })
}

/// Одна сессия до выхода: Ctrl-C = leave
pub async fn run(
    config: Config,
    command: Command,
    display_name: String,
) -> Result<SessionReport, NegotiationError> {
    let rooms = Arc::new(HttpRoomRepository::new(&config.server_url));
    let (room_id, role) = match command {
        Command::Host { password } => (rooms.create_room(&password).await?, Role::Host),
        Command::Join { room_id, password } => {
            (rooms.join_room(&room_id, &password).await?, Role::Joiner)
        }
    };
    println!("Room: {room_id}");

    let deps = Collaborators {
        adapter: Arc::new(WebRtcAdapter::new(config.negotiation.relay_only)?),
        channel: Arc::new(WsSignalingChannel::new(&config.signaling_url)),
        rooms,
        media: Arc::new(SyntheticCapture::new(
            config.negotiation.capture_audio,
            config.negotiation.capture_video,
        )),
        ice: ice_provider(&config)?,
        retry: RetryScheduler::new(),
    };

    let session = Session::new(room_id, role, display_name);
    let (machine, mut events) = NegotiationStateMachine::new(session, deps, config.negotiation);
    let (handle, task) = machine.spawn();
    info!("Session {} started", handle.session_id());

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { to, .. } => println!("State: {to}"),
                SessionEvent::PeerNamed(name) => println!("Connected with {name}"),
                SessionEvent::RemoteTrack(track) => {
                    println!("Receiving {:?} from {}", track.kind, track.stream_id)
                }
                SessionEvent::CandidateRejected { reason, .. } => {
                    println!("Candidate rejected: {reason}")
                }
                SessionEvent::Terminated { state, error } => {
                    match error {
                        Some(e) => println!("Session {state}: {e}"),
                        None => println!("Session {state}"),
                    }
                    break;
                }
            }
        }
    });

    let leave = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, leaving room");
            let _ = leave.leave();
        }
    });

    let report = task
        .await
        .map_err(|e| NegotiationError::Adapter(format!("session task failed: {e}")))?;
    if let Err(e) = printer.await {
        error!("event printer failed: {e}");
    }
    Ok(report)
}
