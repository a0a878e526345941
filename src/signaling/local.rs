use super::{
    decode, encode, AnswerCall, EventKind, OfferCall, ResendCandidates, SignalingChannel,
    Subscribers, Subscription, UserAnswer,
};
use crate::error::NegotiationError;
use crate::room::{offer_not_published, RoomInfo, RoomRepository};
use crate::utils::random_id;
use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

type EndpointId = u64;

#[derive(Default)]
struct Endpoint {
    connected: bool,
    subscribers: Subscribers,
}

struct Room {
    password: String,
    offer: Option<OfferCall>,
    host: Option<EndpointId>,
    joiner: Option<EndpointId>,
}

#[derive(Default)]
struct RelayState {
    endpoints: HashMap<EndpointId, Endpoint>,
    rooms: HashMap<String, Room>,
    next_endpoint: EndpointId,
    refuse_connections: bool,
    history: Vec<(EventKind, Value)>,
}

impl RelayState {
    fn room_mut(&mut self, room_id: &str) -> Result<&mut Room, NegotiationError> {
        self.rooms
            .get_mut(room_id)
            .ok_or_else(|| NegotiationError::RoomNotFound(room_id.to_string()))
    }

    fn deliver(&mut self, to: Option<EndpointId>, kind: EventKind, payload: &Value) -> usize {
        let Some(endpoint) = to.and_then(|id| self.endpoints.get_mut(&id)) else {
            debug!("relay: no recipient for {kind}");
            return 0;
        };
        if !endpoint.connected {
            debug!("relay: recipient of {kind} is offline");
            return 0;
        }
        endpoint.subscribers.dispatch(kind, payload)
    }
}

/// Relay и сервис комнат в одном процессе.
///
/// Маршрутизирует сообщения так же, как сигнальный сервер: offer-call публикует
/// предложение комнаты, answer-call уходит хосту как user-answer,
/// resend-candidates от хоста пересылается второму участнику.
/// Участник снимается с учёта при drop своего LocalChannel. Журнал `history`
/// хранится всё время жизни relay и нужен для тестов и отладки.
#[derive(Clone, Default)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Новый участник relay
    pub fn channel(&self) -> LocalChannel {
        let mut state = self.state.lock();
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        state.endpoints.insert(id, Endpoint::default());
        LocalChannel {
            relay: self.clone(),
            endpoint: id,
        }
    }

    /// Обрыв relay: все подписки закрываются
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        for endpoint in state.endpoints.values_mut() {
            endpoint.connected = false;
            endpoint.subscribers.clear();
        }
        warn!("relay: all endpoints disconnected");
    }

    /// Новые подключения отклоняются, пока флаг установлен
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    /// Сообщение хосту комнаты от имени сервера
    pub fn push_to_host(
        &self,
        room_id: &str,
        answer: &UserAnswer,
    ) -> Result<usize, NegotiationError> {
        let payload = encode(answer)?;
        let mut state = self.state.lock();
        let host = state.room_mut(room_id)?.host;
        Ok(state.deliver(host, EventKind::UserAnswer, &payload))
    }

    /// Все сообщения, принятые relay, в порядке получения
    pub fn history(&self) -> Vec<(EventKind, Value)> {
        self.state.lock().history.clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    fn route(
        &self,
        from: EndpointId,
        kind: EventKind,
        payload: Value,
    ) -> Result<(), NegotiationError> {
        let mut state = self.state.lock();
        if !state.endpoints.get(&from).is_some_and(|e| e.connected) {
            return Err(NegotiationError::SignalingUnavailable(
                "not connected to relay".into(),
            ));
        }

        match kind {
            EventKind::OfferCall => {
                let offer: OfferCall = decode(kind, payload.clone())?;
                let room = state.room_mut(&offer.room_id)?;
                room.host = Some(from);
                info!(
                    "relay: room {} published offer with {} candidates",
                    offer.room_id,
                    offer.candidates.len()
                );
                room.offer = Some(offer);
            }
            EventKind::AnswerCall => {
                let answer: AnswerCall = decode(kind, payload.clone())?;
                let room = state.room_mut(&answer.room_id)?;
                room.joiner = Some(from);
                let host = room.host;
                let forwarded = encode(&UserAnswer {
                    answer: Some(answer.answer),
                    candidates: answer.candidates,
                    display_name: Some(answer.display_name),
                })?;
                state.deliver(host, EventKind::UserAnswer, &forwarded);
            }
            EventKind::ResendCandidates => {
                let request: ResendCandidates = decode(kind, payload.clone())?;
                let joiner = state.room_mut(&request.room_id)?.joiner;
                state.deliver(joiner, kind, &payload);
            }
            EventKind::UserAnswer => {
                return Err(NegotiationError::Protocol(
                    "user-answer is only sent by the relay".into(),
                ));
            }
        }

        state.history.push((kind, payload));
        Ok(())
    }
}

#[async_trait]
impl RoomRepository for LocalRelay {
    async fn create_room(&self, password: &str) -> Result<String, NegotiationError> {
        let room_id = random_id();
        self.state.lock().rooms.insert(
            room_id.clone(),
            Room {
                password: password.to_string(),
                offer: None,
                host: None,
                joiner: None,
            },
        );
        info!("relay: room {room_id} created");
        Ok(room_id)
    }

    async fn join_room(&self, room_id: &str, password: &str) -> Result<String, NegotiationError> {
        let mut state = self.state.lock();
        let room = state.room_mut(room_id)?;
        if room.password != password {
            return Err(NegotiationError::RoomNotFound(room_id.to_string()));
        }
        Ok(room_id.to_string())
    }

    async fn fetch_room_info(&self, room_id: &str) -> Result<RoomInfo, NegotiationError> {
        let mut state = self.state.lock();
        let offer = state
            .room_mut(room_id)?
            .offer
            .clone()
            .ok_or_else(|| offer_not_published(room_id))?;
        Ok(RoomInfo {
            offer: offer.offer,
            candidates: offer.candidates,
            display_name: Some(offer.display_name),
        })
    }
}

/// Подключение одного участника к LocalRelay
pub struct LocalChannel {
    relay: LocalRelay,
    endpoint: EndpointId,
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        let mut state = self.relay.state.lock();
        state.endpoints.remove(&self.endpoint);
        for room in state.rooms.values_mut() {
            if room.host == Some(self.endpoint) {
                room.host = None;
            }
            if room.joiner == Some(self.endpoint) {
                room.joiner = None;
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for LocalChannel {
    async fn connect(&self) -> Result<(), NegotiationError> {
        let mut state = self.relay.state.lock();
        if state.refuse_connections {
            return Err(NegotiationError::SignalingUnavailable(
                "relay refused connection".into(),
            ));
        }
        state.endpoints.entry(self.endpoint).or_default().connected = true;
        Ok(())
    }

    async fn send(&self, kind: EventKind, payload: Value) -> Result<(), NegotiationError> {
        self.relay.route(self.endpoint, kind, payload)
    }

    fn subscribe(&self, kind: EventKind) -> Result<Subscription, NegotiationError> {
        let mut state = self.relay.state.lock();
        match state.endpoints.get_mut(&self.endpoint) {
            Some(endpoint) if endpoint.connected => Ok(endpoint.subscribers.add(kind)),
            _ => Err(NegotiationError::SignalingUnavailable(
                "not connected to relay".into(),
            )),
        }
    }

    async fn disconnect(&self) -> Result<(), NegotiationError> {
        if let Some(endpoint) = self.relay.state.lock().endpoints.get_mut(&self.endpoint) {
            endpoint.connected = false;
            endpoint.subscribers.clear();
        }
        Ok(())
    }
}
