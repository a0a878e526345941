use crate::error::NegotiationError;
use crate::peer::adapter::RemoteTrack;
use crate::utils::random_id;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Сторона звонка
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Joiner => f.write_str("joiner"),
        }
    }
}

/// Локальный идентификатор сессии (ключ в RetryScheduler и в логах)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn random() -> Self {
        SessionId(random_id())
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        SessionId(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Состояния согласования, в порядке прохождения
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    CapturingMedia,
    DescribingLocal,
    GatheringCandidates,
    AwaitingRemote,
    Negotiated,
    Closed,
    Failed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::CapturingMedia => 1,
            SessionState::DescribingLocal => 2,
            SessionState::GatheringCandidates => 3,
            SessionState::AwaitingRemote => 4,
            SessionState::Negotiated => 5,
            SessionState::Closed | SessionState::Failed => 6,
        }
    }

    /// Closed или Failed: сессия больше ничего не принимает
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Переходы только вперёд; Failed достижим лишь из AwaitingRemote.
    pub fn can_advance_to(self, next: SessionState) -> bool {
        if self.is_finished() {
            return false;
        }
        match next {
            SessionState::Closed => true,
            SessionState::Failed => self == SessionState::AwaitingRemote,
            _ => self != SessionState::Negotiated && next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::CapturingMedia => "capturing-media",
            SessionState::DescribingLocal => "describing-local",
            SessionState::GatheringCandidates => "gathering-candidates",
            SessionState::AwaitingRemote => "awaiting-remote",
            SessionState::Negotiated => "negotiated",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Одна попытка согласования в комнате. Принадлежит ровно одной машине состояний.
#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    room_id: String,
    role: Role,
    display_name: String,
    state: SessionState,
}

impl Session {
    pub fn new(room_id: impl Into<String>, role: Role, display_name: impl Into<String>) -> Self {
        Self {
            id: SessionId::random(),
            room_id: room_id.into(),
            role,
            display_name: display_name.into(),
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Монотонный переход; возвращает предыдущее состояние.
    pub fn advance(&mut self, next: SessionState) -> Result<SessionState, NegotiationError> {
        let from = self.state;
        if !from.can_advance_to(next) {
            return Err(NegotiationError::InvalidTransition { from, to: next });
        }
        self.state = next;
        Ok(from)
    }
}

/// События для владельца сессии (UI, CLI)
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    PeerNamed(String),
    RemoteTrack(RemoteTrack),
    CandidateRejected {
        candidate: String,
        reason: String,
    },
    Terminated {
        state: SessionState,
        error: Option<NegotiationError>,
    },
}

/// Итог работы сессии
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub room_id: String,
    pub role: Role,
    pub state: SessionState,
    pub error: Option<NegotiationError>,
    pub retries_scheduled: u32,
    pub candidates_sent: usize,
    pub candidates_applied: usize,
    pub candidates_rejected: usize,
    pub remote_display_name: Option<String>,
}
