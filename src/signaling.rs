pub mod local;
pub mod websocket;

use crate::error::NegotiationError;
use crate::peer::types::SessionDescription;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;

pub use local::{LocalChannel, LocalRelay};
pub use websocket::WsSignalingChannel;

/// Виды сигнальных сообщений
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    OfferCall,
    AnswerCall,
    UserAnswer,
    ResendCandidates,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OfferCall => "offer-call",
            EventKind::AnswerCall => "answer-call",
            EventKind::UserAnswer => "user-answer",
            EventKind::ResendCandidates => "resend-candidates",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "offer-call" => Some(EventKind::OfferCall),
            "answer-call" => Some(EventKind::AnswerCall),
            "user-answer" => Some(EventKind::UserAnswer),
            "resend-candidates" => Some(EventKind::ResendCandidates),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host -> relay: offer и собранные кандидаты
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfferCall {
    pub room_id: String,
    pub offer: SessionDescription,
    pub candidates: Vec<String>,
    #[serde(alias = "userName")]
    pub display_name: String,
}

/// Joiner -> relay: answer и собранные кандидаты
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerCall {
    pub room_id: String,
    pub answer: SessionDescription,
    pub candidates: Vec<String>,
    #[serde(alias = "userName")]
    pub display_name: String,
}

/// Relay -> host: ответ собеседника
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserAnswer {
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default, alias = "userName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Запрос на повторную отправку кандидатов
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResendCandidates {
    pub room_id: String,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Value, NegotiationError> {
    Ok(serde_json::to_value(message)?)
}

pub fn decode<T: DeserializeOwned>(kind: EventKind, payload: Value) -> Result<T, NegotiationError> {
    serde_json::from_value(payload)
        .map_err(|e| NegotiationError::Protocol(format!("{kind}: {e}")))
}

/// Подписка на один вид сообщений. Drop = отписка.
#[derive(Debug)]
pub struct Subscription {
    kind: EventKind,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// None - соединение с relay потеряно
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// Таблица подписчиков одного участника
#[derive(Debug, Default)]
pub(crate) struct Subscribers {
    by_kind: HashMap<EventKind, Vec<mpsc::UnboundedSender<Value>>>,
}

impl Subscribers {
    pub(crate) fn add(&mut self, kind: EventKind) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.by_kind.entry(kind).or_default().push(tx);
        Subscription { kind, rx }
    }

    /// Возвращает число получателей; закрытые подписки выбрасываются
    pub(crate) fn dispatch(&mut self, kind: EventKind, payload: &Value) -> usize {
        let Some(senders) = self.by_kind.get_mut(&kind) else {
            return 0;
        };
        senders.retain(|tx| tx.send(payload.clone()).is_ok());
        senders.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_kind.clear();
    }
}

/// Шина сообщений между участниками через relay
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn connect(&self) -> Result<(), NegotiationError>;

    async fn send(&self, kind: EventKind, payload: Value) -> Result<(), NegotiationError>;

    fn subscribe(&self, kind: EventKind) -> Result<Subscription, NegotiationError>;

    async fn disconnect(&self) -> Result<(), NegotiationError>;
}
