use crate::config::NegotiationConfig;
use crate::error::NegotiationError;
use crate::logger::{dump_candidate, Emitter};
use crate::peer::adapter::{AdapterEvent, AdapterEvents, LocalTrack, PeerConnectionAdapter};
use crate::peer::candidates::{CandidateBuffer, RemoteCandidateQueue};
use crate::peer::ice::{analyze_candidates, resolve_ice_servers, IceServerProvider};
use crate::peer::media::MediaSource;
use crate::peer::types::{IceCandidate, IceServer, SessionDescription};
use crate::retry::RetryScheduler;
use crate::room::{RoomInfo, RoomRepository};
use crate::session::{Role, Session, SessionEvent, SessionId, SessionReport, SessionState};
use crate::signaling::{
    decode, encode, AnswerCall, EventKind, OfferCall, ResendCandidates, SignalingChannel,
    Subscription, UserAnswer,
};
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Результат подготовки: захваченное медиа и ICE серверы
#[derive(Debug)]
pub struct Prepared {
    pub tracks: Vec<LocalTrack>,
    pub ice_servers: Vec<IceServer>,
}

/// Всё, что попадает в очередь сессии
#[derive(Debug)]
pub enum SessionInput {
    Start,
    Leave,
    Prepared(Result<Prepared, NegotiationError>),
    RoomInfo(Result<RoomInfo, NegotiationError>),
    Adapter(AdapterEvent),
    Signal { kind: EventKind, payload: Value },
    RetryFired,
    /// Подписка закрылась: соединение с relay потеряно
    ChannelLost(EventKind),
}

/// Зависимости сессии. Ничего из этого не разделяется между сессиями,
/// кроме RetryScheduler.
#[derive(Clone)]
pub struct Collaborators {
    pub adapter: Arc<dyn PeerConnectionAdapter>,
    pub channel: Arc<dyn SignalingChannel>,
    pub rooms: Arc<dyn RoomRepository>,
    pub media: Arc<dyn MediaSource>,
    pub ice: Arc<dyn IceServerProvider>,
    pub retry: RetryScheduler,
}

/// Управление сессией, запущенной через `spawn`
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    inbox: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Ждёт перехода в указанное состояние или завершения сессии
    pub async fn wait_for(&mut self, target: SessionState) -> SessionState {
        if let Ok(state) = self
            .state
            .wait_for(|state| *state == target || state.is_finished())
            .await
        {
            return *state;
        }
        *self.state.borrow()
    }

    pub fn leave(&self) -> Result<(), NegotiationError> {
        let state = self.state();
        if state.is_finished() {
            return Err(NegotiationError::SessionTerminated { state });
        }
        self.inbox
            .send(SessionInput::Leave)
            .map_err(|_| NegotiationError::SessionTerminated { state })
    }
}

/// Машина состояний согласования одной сессии.
///
/// Все входы идут через одну очередь и обрабатываются по одному до конца.
/// Долгие операции (медиа, ICE, комната) выполняются в отдельных задачах и
/// возвращают результат в очередь; устаревшие результаты отбрасываются.
pub struct NegotiationStateMachine {
    session: Session,
    deps: Collaborators,
    config: NegotiationConfig,
    emitter: Emitter,
    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    inbox_rx: mpsc::UnboundedReceiver<SessionInput>,
    state_tx: watch::Sender<SessionState>,

    started: bool,
    local_description: Option<SessionDescription>,
    buffer: CandidateBuffer,
    remote_queue: RemoteCandidateQueue,
    remote_committed: bool,
    early_answers: VecDeque<UserAnswer>,
    empty_answers: u32,
    /// answer-call, уже отправленный джойнером (для resend-candidates)
    sent_answer: Option<Value>,
    forwarders: Vec<JoinHandle<()>>,

    retries_scheduled: u32,
    candidates_sent: usize,
    candidates_applied: usize,
    candidates_rejected: usize,
    remote_display_name: Option<String>,
    error: Option<NegotiationError>,
}

impl NegotiationStateMachine {
    pub fn new(
        session: Session,
        deps: Collaborators,
        config: NegotiationConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(session.state());
        let emitter = Emitter::new(session.id().clone(), events_tx);

        let machine = Self {
            session,
            deps,
            config,
            emitter,
            inbox_tx,
            inbox_rx,
            state_tx,
            started: false,
            local_description: None,
            buffer: CandidateBuffer::new(),
            remote_queue: RemoteCandidateQueue::new(),
            remote_committed: false,
            early_answers: VecDeque::new(),
            empty_answers: 0,
            sent_answer: None,
            forwarders: Vec::new(),
            retries_scheduled: 0,
            candidates_sent: 0,
            candidates_applied: 0,
            candidates_rejected: 0,
            remote_display_name: None,
            error: None,
        };
        (machine, events_rx)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.session.id().clone(),
            inbox: self.inbox_tx.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    pub fn report(&self) -> SessionReport {
        SessionReport {
            session_id: self.session.id().clone(),
            room_id: self.session.room_id().to_string(),
            role: self.session.role(),
            state: self.session.state(),
            error: self.error.clone(),
            retries_scheduled: self.retries_scheduled,
            candidates_sent: self.candidates_sent,
            candidates_applied: self.candidates_applied,
            candidates_rejected: self.candidates_rejected,
            remote_display_name: self.remote_display_name.clone(),
        }
    }

    /// Обработать один вход. Фатальная ошибка завершает сессию и возвращается.
    pub async fn handle(&mut self, input: SessionInput) -> Result<(), NegotiationError> {
        match input {
            SessionInput::Start => self.start().await,
            SessionInput::Leave => self.leave().await,
            input if self.session.state().is_finished() => {
                debug!(
                    "[{}] discarding {:?} after termination",
                    self.session.id(),
                    input
                );
                Ok(())
            }
            input => {
                let result = match input {
                    SessionInput::Prepared(result) => self.on_prepared(result).await,
                    SessionInput::RoomInfo(result) => self.on_room_info(result).await,
                    SessionInput::Adapter(event) => self.on_adapter_event(event).await,
                    SessionInput::Signal { kind, payload } => self.on_signal(kind, payload).await,
                    SessionInput::RetryFired => self.on_retry_fired().await,
                    SessionInput::ChannelLost(kind) => self.on_channel_lost(kind),
                    SessionInput::Start | SessionInput::Leave => Ok(()),
                };
                match result {
                    Err(e) if e.is_fatal() => {
                        self.fail(e.clone()).await;
                        Err(e)
                    }
                    Err(e) => {
                        warn!("[{}] {e}", self.session.id());
                        Ok(())
                    }
                    Ok(()) => Ok(()),
                }
            }
        }
    }

    /// Дождаться и обработать следующий вход
    pub async fn step(&mut self) -> Result<(), NegotiationError> {
        match self.inbox_rx.recv().await {
            Some(input) => self.handle(input).await,
            None => Ok(()),
        }
    }

    /// Запуск и обработка входов до Closed/Failed
    pub async fn run(mut self) -> SessionReport {
        if !self.started {
            if let Err(e) = self.handle(SessionInput::Start).await {
                debug!("[{}] start failed: {e}", self.session.id());
            }
        }
        while !self.session.state().is_finished() {
            if let Err(e) = self.step().await {
                debug!("[{}] {e}", self.session.id());
            }
        }
        self.report()
    }

    pub fn spawn(self) -> (SessionHandle, JoinHandle<SessionReport>) {
        let handle = self.session_handle();
        (handle, tokio::spawn(self.run()))
    }

    // ---- команды ----

    async fn start(&mut self) -> Result<(), NegotiationError> {
        let state = self.session.state();
        if state.is_finished() {
            return Err(NegotiationError::SessionTerminated { state });
        }
        if self.started {
            return Err(NegotiationError::AlreadyStarted);
        }
        self.started = true;
        info!(
            "[{}] starting as {} in room {}",
            self.session.id(),
            self.session.role(),
            self.session.room_id()
        );

        self.transition(SessionState::CapturingMedia)?;
        if let Err(e) = self.deps.channel.connect().await {
            self.fail(e.clone()).await;
            return Err(e);
        }

        let media = Arc::clone(&self.deps.media);
        let ice = Arc::clone(&self.deps.ice);
        let inbox = self.inbox_tx.clone();
        tokio::spawn(async move {
            let (tracks, ice_servers) =
                tokio::join!(media.acquire(), resolve_ice_servers(ice.as_ref()));
            let prepared = tracks.map(|tracks| Prepared {
                tracks,
                ice_servers,
            });
            let _ = inbox.send(SessionInput::Prepared(prepared));
        });
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), NegotiationError> {
        let state = self.session.state();
        if state.is_finished() {
            return Err(NegotiationError::SessionTerminated { state });
        }
        info!("[{}] leaving in {state}", self.session.id());
        self.terminate(SessionState::Closed, None).await;
        Ok(())
    }

    // ---- завершения асинхронных операций ----

    async fn on_prepared(
        &mut self,
        prepared: Result<Prepared, NegotiationError>,
    ) -> Result<(), NegotiationError> {
        if self.session.state() != SessionState::CapturingMedia {
            debug!("[{}] stale media completion", self.session.id());
            return Ok(());
        }
        let prepared = prepared?;

        self.deps.adapter.configure(&prepared.ice_servers).await?;
        let events = self.deps.adapter.subscribe()?;
        self.forward_adapter(events);
        for track in prepared.tracks {
            self.deps.adapter.attach_local_track(track).await?;
        }

        match self.session.role() {
            Role::Host => self.describe_local().await,
            Role::Joiner => {
                let rooms = Arc::clone(&self.deps.rooms);
                let room_id = self.session.room_id().to_string();
                let inbox = self.inbox_tx.clone();
                tokio::spawn(async move {
                    let info = rooms.fetch_room_info(&room_id).await;
                    let _ = inbox.send(SessionInput::RoomInfo(info));
                });
                Ok(())
            }
        }
    }

    async fn on_room_info(
        &mut self,
        info: Result<RoomInfo, NegotiationError>,
    ) -> Result<(), NegotiationError> {
        if self.session.state() != SessionState::CapturingMedia || self.remote_committed {
            debug!("[{}] stale room info", self.session.id());
            return Ok(());
        }
        let info = info?;

        self.commit_remote(&info.offer).await?;
        if let Some(name) = info.display_name.as_deref() {
            self.remember_peer(name);
        }
        self.remote_queue.extend(info.candidates);
        self.apply_remote_candidates().await?;
        self.describe_local().await
    }

    // ---- шаги протокола ----

    async fn describe_local(&mut self) -> Result<(), NegotiationError> {
        self.transition(SessionState::DescribingLocal)?;

        let role = self.session.role();
        let desc = self.deps.adapter.create_local_description(role).await?;
        self.deps.adapter.commit_local_description(&desc).await?;
        self.buffer.mark_local_committed();
        self.local_description = Some(desc);

        if role == Role::Host {
            let answers = self.deps.channel.subscribe(EventKind::UserAnswer)?;
            self.forward_subscription(answers);
        }
        self.transition(SessionState::GatheringCandidates)
    }

    async fn on_adapter_event(&mut self, event: AdapterEvent) -> Result<(), NegotiationError> {
        match event {
            AdapterEvent::CandidateDiscovered(candidate) => {
                if self.buffer.is_frozen() {
                    debug!(
                        "[{}] candidate after discovery completed: {}",
                        self.session.id(),
                        candidate.candidate
                    );
                    return Ok(());
                }
                dump_candidate("local", &candidate);
                self.buffer.append(candidate)
            }
            AdapterEvent::DiscoveryComplete => {
                if self.session.state() != SessionState::GatheringCandidates {
                    debug!(
                        "[{}] discovery completed in {}",
                        self.session.id(),
                        self.session.state()
                    );
                    return Ok(());
                }
                self.on_discovery_complete().await
            }
            AdapterEvent::RemoteTrack(track) => {
                self.emitter.remote_track(track);
                Ok(())
            }
            AdapterEvent::SignalingStateChanged(state) => {
                debug!("[{}] signaling state: {state}", self.session.id());
                Ok(())
            }
            AdapterEvent::ConnectionStateChanged(state) => {
                info!("[{}] peer connection state: {state}", self.session.id());
                Ok(())
            }
        }
    }

    async fn on_discovery_complete(&mut self) -> Result<(), NegotiationError> {
        self.buffer.freeze()?;
        let drained = self.buffer.drain()?;
        analyze_candidates(&drained);
        if drained.is_empty() {
            warn!(
                "[{}] no local candidates gathered, sending description alone",
                self.session.id()
            );
        }
        let candidates = drained
            .iter()
            .map(IceCandidate::to_wire)
            .collect::<Result<Vec<_>, _>>()?;
        self.candidates_sent = candidates.len();

        let desc = self
            .local_description
            .clone()
            .ok_or_else(|| NegotiationError::Buffer("no local description".into()))?;
        let room_id = self.session.room_id().to_string();
        let display_name = self.session.display_name().to_string();

        match self.session.role() {
            Role::Host => {
                let payload = encode(&OfferCall {
                    room_id,
                    offer: desc,
                    candidates,
                    display_name,
                })?;
                self.deps.channel.send(EventKind::OfferCall, payload).await?;
                info!(
                    "[{}] offer published with {} candidates",
                    self.session.id(),
                    self.candidates_sent
                );
                self.transition(SessionState::AwaitingRemote)?;

                while self.session.state() == SessionState::AwaitingRemote {
                    let Some(answer) = self.early_answers.pop_front() else {
                        break;
                    };
                    debug!("[{}] processing queued answer", self.session.id());
                    self.on_answer(answer).await?;
                }
                Ok(())
            }
            Role::Joiner => {
                let payload = encode(&AnswerCall {
                    room_id,
                    answer: desc,
                    candidates,
                    display_name,
                })?;
                let resends = self.deps.channel.subscribe(EventKind::ResendCandidates)?;
                self.forward_subscription(resends);
                self.deps
                    .channel
                    .send(EventKind::AnswerCall, payload.clone())
                    .await?;
                info!(
                    "[{}] answer sent with {} candidates",
                    self.session.id(),
                    self.candidates_sent
                );
                self.sent_answer = Some(payload);
                self.transition(SessionState::Negotiated)
            }
        }
    }

    async fn on_signal(&mut self, kind: EventKind, payload: Value) -> Result<(), NegotiationError> {
        let state = self.session.state();
        match (kind, self.session.role()) {
            (EventKind::UserAnswer, Role::Host) => {
                if state == SessionState::Negotiated {
                    debug!("[{}] answer after negotiation ignored", self.session.id());
                    return Ok(());
                }
                let answer: UserAnswer = decode(kind, payload)?;
                if state == SessionState::AwaitingRemote {
                    self.on_answer(answer).await
                } else {
                    debug!("[{}] answer arrived in {state}, queued", self.session.id());
                    self.early_answers.push_back(answer);
                    Ok(())
                }
            }
            (EventKind::ResendCandidates, Role::Joiner) => {
                let Some(payload) = self.sent_answer.clone() else {
                    debug!("[{}] resend requested before answer", self.session.id());
                    return Ok(());
                };
                info!("[{}] resending answer on request", self.session.id());
                self.deps.channel.send(EventKind::AnswerCall, payload).await
            }
            _ => {
                debug!(
                    "[{}] ignoring {kind} for {}",
                    self.session.id(),
                    self.session.role()
                );
                Ok(())
            }
        }
    }

    async fn on_answer(&mut self, answer: UserAnswer) -> Result<(), NegotiationError> {
        if let Some(name) = answer.display_name.as_deref() {
            self.remember_peer(name);
        }

        if answer.candidates.is_empty() {
            self.empty_answers += 1;
            if self.empty_answers > self.config.max_retries {
                return Err(NegotiationError::NegotiationTimeout {
                    attempts: self.empty_answers,
                });
            }
            self.schedule_resend();
            return Ok(());
        }

        if !self.remote_committed {
            let desc = answer.answer.ok_or_else(|| {
                NegotiationError::Protocol("user-answer carries no answer description".into())
            })?;
            self.commit_remote(&desc).await?;
        }
        self.remote_queue.extend(answer.candidates);
        self.apply_remote_candidates().await?;

        self.transition(SessionState::Negotiated)?;
        self.deps.retry.cancel(self.session.id());
        Ok(())
    }

    fn schedule_resend(&mut self) {
        let inbox = self.inbox_tx.clone();
        self.deps.retry.schedule_retry(
            self.session.id(),
            self.config.retry_delay,
            async move {
                let _ = inbox.send(SessionInput::RetryFired);
            },
        );
        self.retries_scheduled += 1;
        info!(
            "[{}] answer without candidates ({}/{}), resend in {:?}",
            self.session.id(),
            self.empty_answers,
            self.config.max_retries,
            self.config.retry_delay
        );
    }

    async fn on_retry_fired(&mut self) -> Result<(), NegotiationError> {
        if self.session.state() != SessionState::AwaitingRemote {
            debug!("[{}] retry fired in {}", self.session.id(), self.session.state());
            return Ok(());
        }
        let payload = encode(&ResendCandidates {
            room_id: self.session.room_id().to_string(),
        })?;
        self.deps
            .channel
            .send(EventKind::ResendCandidates, payload)
            .await
    }

    fn on_channel_lost(&mut self, kind: EventKind) -> Result<(), NegotiationError> {
        if self.session.state() == SessionState::Negotiated {
            warn!(
                "[{}] relay connection lost after negotiation ({kind})",
                self.session.id()
            );
            return Ok(());
        }
        Err(NegotiationError::SignalingUnavailable(format!(
            "relay connection lost while waiting for {kind}"
        )))
    }

    // ---- вспомогательное ----

    /// Remote description устанавливается не больше одного раза
    async fn commit_remote(&mut self, desc: &SessionDescription) -> Result<(), NegotiationError> {
        if self.remote_committed {
            debug!("[{}] remote description already committed", self.session.id());
            return Ok(());
        }
        self.deps.adapter.commit_remote_description(desc).await?;
        self.remote_committed = true;
        self.remote_queue.mark_ready();
        Ok(())
    }

    /// Ошибки отдельных кандидатов не фатальны: собираются в отчёт
    async fn apply_remote_candidates(&mut self) -> Result<(), NegotiationError> {
        for raw in self.remote_queue.take_ready() {
            let result = match IceCandidate::from_wire(&raw) {
                Ok(candidate) => {
                    dump_candidate("remote", &candidate);
                    self.deps.adapter.apply_candidate(&candidate).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => self.candidates_applied += 1,
                Err(NegotiationError::CandidateApplication { candidate, reason }) => {
                    self.candidates_rejected += 1;
                    self.emitter.candidate_rejected(&candidate, &reason);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn remember_peer(&mut self, name: &str) {
        if self.remote_display_name.as_deref() == Some(name) {
            return;
        }
        self.remote_display_name = Some(name.to_string());
        self.emitter.peer_named(name);
    }

    fn transition(&mut self, next: SessionState) -> Result<(), NegotiationError> {
        let from = self.session.advance(next)?;
        self.state_tx.send_replace(next);
        self.emitter.state_changed(from, next);
        Ok(())
    }

    fn forward_adapter(&mut self, mut events: AdapterEvents) {
        let inbox = self.inbox_tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inbox.send(SessionInput::Adapter(event)).is_err() {
                    break;
                }
            }
        }));
    }

    fn forward_subscription(&mut self, mut subscription: Subscription) {
        let inbox = self.inbox_tx.clone();
        self.forwarders.push(tokio::spawn(async move {
            let kind = subscription.kind();
            while let Some(payload) = subscription.recv().await {
                if inbox.send(SessionInput::Signal { kind, payload }).is_err() {
                    return;
                }
            }
            let _ = inbox.send(SessionInput::ChannelLost(kind));
        }));
    }

    async fn fail(&mut self, error: NegotiationError) {
        let target = match error {
            NegotiationError::NegotiationTimeout { .. } => SessionState::Failed,
            _ => SessionState::Closed,
        };
        self.terminate(target, Some(error)).await;
    }

    /// Закрыть всё, что принадлежит сессии. Возобновить нельзя.
    async fn terminate(&mut self, target: SessionState, error: Option<NegotiationError>) {
        if self.session.state().is_finished() {
            return;
        }
        if let Err(e) = self.transition(target) {
            warn!("[{}] {e}", self.session.id());
            return;
        }

        self.deps.retry.cancel(self.session.id());
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
        self.early_answers.clear();
        if let Err(e) = self.deps.adapter.close().await {
            warn!("[{}] adapter close failed: {e}", self.session.id());
        }
        if let Err(e) = self.deps.channel.disconnect().await {
            warn!("[{}] channel disconnect failed: {e}", self.session.id());
        }

        self.error = error.clone();
        self.emitter.terminated(target, error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::LocalRelay;
    use crate::testing::{
        collaborators, host_candidate, webrtc_collaborators, wire, FailingMedia, MockAdapter,
        RecordingChannel,
    };
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn config() -> NegotiationConfig {
        NegotiationConfig::default()
    }

    fn bad_candidate() -> IceCandidate {
        IceCandidate::new("candidate:9 1 udp 1 bad-address 9 typ host")
    }

    async fn step_until(machine: &mut NegotiationStateMachine, target: SessionState) {
        timeout(Duration::from_secs(60), async {
            while machine.state() != target && !machine.state().is_finished() {
                let _ = machine.step().await;
            }
        })
        .await
        .expect("session did not reach the expected state");
        assert_eq!(machine.state(), target);
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Хост в AwaitingRemote на LocalRelay
    async fn awaiting_host(
        relay: &LocalRelay,
        adapter: Arc<MockAdapter>,
        retry: RetryScheduler,
    ) -> (NegotiationStateMachine, mpsc::UnboundedReceiver<SessionEvent>) {
        let room_id = relay.create_room("pw").await.unwrap();
        let session = Session::new(room_id, Role::Host, "USER-1");
        let (mut machine, events) =
            NegotiationStateMachine::new(session, collaborators(relay, adapter, retry), config());
        machine.handle(SessionInput::Start).await.unwrap();
        step_until(&mut machine, SessionState::AwaitingRemote).await;
        (machine, events)
    }

    fn answer_with(candidates: Vec<String>) -> UserAnswer {
        UserAnswer {
            answer: Some(SessionDescription::answer("v=0 remote-answer")),
            candidates,
            display_name: Some("USER-2".into()),
        }
    }

    async fn deliver(
        relay: &LocalRelay,
        machine: &mut NegotiationStateMachine,
        answer: UserAnswer,
    ) -> Result<(), NegotiationError> {
        relay
            .push_to_host(machine.session().room_id(), &answer)
            .unwrap();
        machine.step().await
    }

    #[tokio::test(start_paused = true)]
    async fn host_publishes_offer_with_gathered_candidates() {
        let relay = LocalRelay::new();
        let adapter = MockAdapter::new(vec![host_candidate(1), host_candidate(2)]);
        let (machine, mut events) =
            awaiting_host(&relay, adapter.clone(), RetryScheduler::new()).await;

        let history = relay.history();
        assert_eq!(history.len(), 1);
        let (kind, payload) = &history[0];
        assert_eq!(*kind, EventKind::OfferCall);
        let offer: OfferCall = decode(*kind, payload.clone()).unwrap();
        assert_eq!(offer.offer, SessionDescription::offer("v=0 mock-offer"));
        assert_eq!(offer.candidates, wire(&[host_candidate(1), host_candidate(2)]));
        assert_eq!(offer.display_name, "USER-1");
        assert_eq!(machine.report().candidates_sent, 2);

        let states: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::CapturingMedia,
                SessionState::DescribingLocal,
                SessionState::GatheringCandidates,
                SessionState::AwaitingRemote,
            ]
        );
        assert_eq!(adapter.state.lock().tracks, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_between_two_sessions() {
        let relay = LocalRelay::new();
        let retry = RetryScheduler::new();
        let host_adapter = MockAdapter::new(vec![host_candidate(1), host_candidate(2)]);
        let (mut host, mut host_events) =
            awaiting_host(&relay, host_adapter.clone(), retry.clone()).await;

        let room_id = host.session().room_id().to_string();
        relay.join_room(&room_id, "pw").await.unwrap();
        let joiner_adapter = MockAdapter::new(vec![
            host_candidate(11),
            host_candidate(12),
            host_candidate(13),
        ]);
        let (joiner, _joiner_events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Joiner, "USER-2"),
            collaborators(&relay, joiner_adapter.clone(), retry.clone()),
            config(),
        );
        let joiner_id = joiner.session().id().clone();
        let (joiner_handle, joiner_task) = joiner.spawn();
        assert_eq!(joiner_handle.session_id(), &joiner_id);
        let mut watcher = joiner_handle.clone();
        assert_eq!(
            watcher.wait_for(SessionState::Negotiated).await,
            SessionState::Negotiated
        );

        step_until(&mut host, SessionState::Negotiated).await;
        assert_eq!(host_adapter.remote_commits(), 1);
        assert_eq!(host_adapter.applied(), 3);
        assert_eq!(joiner_adapter.remote_commits(), 1);
        assert_eq!(joiner_adapter.applied(), 2);
        assert_eq!(retry.outstanding(), 0);

        let report = host.report();
        assert_eq!(report.candidates_applied, 3);
        assert_eq!(report.retries_scheduled, 0);
        assert_eq!(report.remote_display_name.as_deref(), Some("USER-2"));
        assert!(drain_events(&mut host_events)
            .iter()
            .any(|e| matches!(e, SessionEvent::PeerNamed(name) if name == "USER-2")));

        joiner_handle.leave().unwrap();
        let joiner_report = joiner_task.await.unwrap();
        assert_eq!(joiner_report.state, SessionState::Closed);
        assert_eq!(joiner_report.candidates_sent, 3);
        assert_eq!(joiner_report.candidates_applied, 2);
        assert_eq!(joiner_report.remote_display_name.as_deref(), Some("USER-1"));
        assert!(joiner_adapter.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn webrtc_sessions_negotiate_through_local_relay() {
        let relay = LocalRelay::new();
        let room_id = relay.create_room("pw").await.unwrap();
        let (host, _host_events) = NegotiationStateMachine::new(
            Session::new(room_id.clone(), Role::Host, "USER-1"),
            webrtc_collaborators(&relay),
            config(),
        );
        let (host_handle, host_task) = host.spawn();
        let mut host_watch = host_handle.clone();
        let state = timeout(
            Duration::from_secs(60),
            host_watch.wait_for(SessionState::AwaitingRemote),
        )
        .await
        .expect("host did not publish an offer");
        assert_eq!(state, SessionState::AwaitingRemote);

        relay.join_room(&room_id, "pw").await.unwrap();
        let (joiner, _joiner_events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Joiner, "USER-2"),
            webrtc_collaborators(&relay),
            config(),
        );
        let (joiner_handle, joiner_task) = joiner.spawn();
        let mut joiner_watch = joiner_handle.clone();
        for watch in [&mut joiner_watch, &mut host_watch] {
            let state = timeout(
                Duration::from_secs(60),
                watch.wait_for(SessionState::Negotiated),
            )
            .await
            .expect("session did not negotiate");
            assert_eq!(state, SessionState::Negotiated);
        }

        host_handle.leave().unwrap();
        joiner_handle.leave().unwrap();
        let host_report = host_task.await.unwrap();
        let joiner_report = joiner_task.await.unwrap();

        assert_eq!(host_report.state, SessionState::Closed);
        assert_eq!(host_report.error, None);
        assert_eq!(joiner_report.state, SessionState::Closed);
        assert_eq!(joiner_report.error, None);
        assert!(host_report.candidates_sent > 0);
        assert!(joiner_report.candidates_sent > 0);
        assert_eq!(
            host_report.candidates_applied + host_report.candidates_rejected,
            joiner_report.candidates_sent
        );
        assert_eq!(
            joiner_report.candidates_applied + joiner_report.candidates_rejected,
            host_report.candidates_sent
        );
        assert_eq!(host_report.retries_scheduled, 0);
        assert_eq!(host_report.remote_display_name.as_deref(), Some("USER-2"));
        assert_eq!(joiner_report.remote_display_name.as_deref(), Some("USER-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn two_empty_answers_then_success() {
        let relay = LocalRelay::new();
        let retry = RetryScheduler::new();
        let (mut host, _events) =
            awaiting_host(&relay, MockAdapter::new(vec![host_candidate(1)]), retry.clone()).await;

        for attempt in 1..=2 {
            deliver(&relay, &mut host, answer_with(vec![])).await.unwrap();
            assert_eq!(host.state(), SessionState::AwaitingRemote);
            assert!(retry.is_pending(host.session().id()));
            // срабатывание ретрая -> resend-candidates
            host.step().await.unwrap();
            assert_eq!(relay.count(EventKind::ResendCandidates), attempt);
        }

        deliver(&relay, &mut host, answer_with(wire(&[host_candidate(5)])))
            .await
            .unwrap();
        assert_eq!(host.state(), SessionState::Negotiated);
        assert_eq!(host.report().retries_scheduled, 2);
        assert_eq!(retry.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_session() {
        let relay = LocalRelay::new();
        let retry = RetryScheduler::new();
        let adapter = MockAdapter::new(vec![host_candidate(1)]);
        let (mut host, mut events) = awaiting_host(&relay, adapter.clone(), retry.clone()).await;

        for _ in 0..5 {
            deliver(&relay, &mut host, answer_with(vec![])).await.unwrap();
        }
        assert_eq!(host.report().retries_scheduled, 5);

        let err = deliver(&relay, &mut host, answer_with(vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, NegotiationError::NegotiationTimeout { attempts: 6 });
        assert_eq!(host.state(), SessionState::Failed);
        assert_eq!(host.report().retries_scheduled, 5);
        assert_eq!(retry.outstanding(), 0);
        assert!(adapter.is_closed());

        let terminated: Vec<_> = drain_events(&mut events)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::Terminated { .. }))
            .collect();
        assert_eq!(terminated.len(), 1);
        assert!(matches!(
            &terminated[0],
            SessionEvent::Terminated {
                state: SessionState::Failed,
                error: Some(NegotiationError::NegotiationTimeout { attempts: 6 })
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_candidate_does_not_abort_negotiation() {
        let relay = LocalRelay::new();
        let adapter = MockAdapter::new(vec![host_candidate(1)]);
        let (mut host, mut events) =
            awaiting_host(&relay, adapter.clone(), RetryScheduler::new()).await;

        let candidates = wire(&[
            host_candidate(21),
            bad_candidate(),
            host_candidate(22),
            host_candidate(23),
        ]);
        deliver(&relay, &mut host, answer_with(candidates)).await.unwrap();

        assert_eq!(host.state(), SessionState::Negotiated);
        let report = host.report();
        assert_eq!(report.candidates_applied, 3);
        assert_eq!(report.candidates_rejected, 1);
        assert!(report.error.is_none());
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::CandidateRejected { candidate, .. } if candidate.contains("bad")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_description_committed_once() {
        let relay = LocalRelay::new();
        let adapter = MockAdapter::new(vec![host_candidate(1)]);
        let (mut host, _events) =
            awaiting_host(&relay, adapter.clone(), RetryScheduler::new()).await;

        deliver(&relay, &mut host, answer_with(wire(&[host_candidate(2)])))
            .await
            .unwrap();
        let mut late = answer_with(wire(&[host_candidate(3)]));
        late.answer = Some(SessionDescription::answer("v=0 different"));
        deliver(&relay, &mut host, late).await.unwrap();

        assert_eq!(host.state(), SessionState::Negotiated);
        assert_eq!(adapter.remote_commits(), 1);
        assert_eq!(adapter.applied(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_candidate_on_wire_before_local_commit() {
        let relay = LocalRelay::new();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let adapter = MockAdapter::with_journal(
            vec![host_candidate(1), host_candidate(2)],
            journal.clone(),
        );
        let mut deps = collaborators(&relay, adapter, RetryScheduler::new());
        deps.channel = Arc::new(RecordingChannel::new(relay.channel(), journal.clone()));

        let room_id = relay.create_room("pw").await.unwrap();
        let (mut host, _events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Host, "USER-1"),
            deps,
            config(),
        );
        host.handle(SessionInput::Start).await.unwrap();
        step_until(&mut host, SessionState::AwaitingRemote).await;

        let journal = journal.lock().clone();
        let commit = journal
            .iter()
            .position(|e| e == "adapter:commit-local")
            .unwrap();
        let send = journal
            .iter()
            .position(|e| e.starts_with("channel:send:"))
            .unwrap();
        assert!(commit < send, "{journal:?}");
        assert_eq!(journal[send], "channel:send:offer-call:2");
    }

    #[tokio::test(start_paused = true)]
    async fn early_answer_is_processed_on_entering_awaiting() {
        let relay = LocalRelay::new();
        let adapter = MockAdapter::new(vec![host_candidate(1)]);
        let room_id = relay.create_room("pw").await.unwrap();
        let (mut host, _events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Host, "USER-1"),
            collaborators(&relay, adapter.clone(), RetryScheduler::new()),
            config(),
        );
        host.handle(SessionInput::Start).await.unwrap();
        step_until(&mut host, SessionState::GatheringCandidates).await;

        let payload = encode(&answer_with(wire(&[host_candidate(7)]))).unwrap();
        host.handle(SessionInput::Signal {
            kind: EventKind::UserAnswer,
            payload,
        })
        .await
        .unwrap();
        assert_eq!(host.state(), SessionState::GatheringCandidates);
        assert_eq!(adapter.remote_commits(), 0);

        step_until(&mut host, SessionState::Negotiated).await;
        assert_eq!(adapter.remote_commits(), 1);
        assert_eq!(adapter.applied(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_in_any_state_leaves_no_retry() {
        let targets = [
            SessionState::Idle,
            SessionState::CapturingMedia,
            SessionState::GatheringCandidates,
            SessionState::AwaitingRemote,
            SessionState::Negotiated,
        ];
        for target in targets {
            let relay = LocalRelay::new();
            let retry = RetryScheduler::new();
            let adapter = MockAdapter::new(vec![host_candidate(1)]);
            let room_id = relay.create_room("pw").await.unwrap();
            let (mut host, _events) = NegotiationStateMachine::new(
                Session::new(room_id, Role::Host, "USER-1"),
                collaborators(&relay, adapter.clone(), retry.clone()),
                config(),
            );
            match target {
                SessionState::Idle => {}
                SessionState::AwaitingRemote => {
                    host.handle(SessionInput::Start).await.unwrap();
                    step_until(&mut host, target).await;
                    deliver(&relay, &mut host, answer_with(vec![])).await.unwrap();
                    assert_eq!(retry.outstanding(), 1);
                }
                SessionState::Negotiated => {
                    host.handle(SessionInput::Start).await.unwrap();
                    step_until(&mut host, SessionState::AwaitingRemote).await;
                    deliver(&relay, &mut host, answer_with(vec![])).await.unwrap();
                    deliver(&relay, &mut host, answer_with(wire(&[host_candidate(2)])))
                        .await
                        .unwrap();
                    assert_eq!(host.state(), SessionState::Negotiated);
                }
                _ => {
                    host.handle(SessionInput::Start).await.unwrap();
                    step_until(&mut host, target).await;
                }
            }

            host.handle(SessionInput::Leave).await.unwrap();
            assert_eq!(host.state(), SessionState::Closed, "leave from {target}");
            assert_eq!(retry.outstanding(), 0, "leave from {target}");
            assert!(adapter.is_closed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finished_session_rejects_commands() {
        let relay = LocalRelay::new();
        let (mut host, _events) = awaiting_host(
            &relay,
            MockAdapter::new(vec![host_candidate(1)]),
            RetryScheduler::new(),
        )
        .await;
        host.handle(SessionInput::Leave).await.unwrap();

        assert_eq!(
            host.handle(SessionInput::Start).await,
            Err(NegotiationError::SessionTerminated {
                state: SessionState::Closed
            })
        );
        assert_eq!(
            host.handle(SessionInput::Leave).await,
            Err(NegotiationError::SessionTerminated {
                state: SessionState::Closed
            })
        );
        // поздние завершения отбрасываются
        host.handle(SessionInput::RetryFired).await.unwrap();
        host.handle(SessionInput::Signal {
            kind: EventKind::UserAnswer,
            payload: json!({"candidates": ["x"]}),
        })
        .await
        .unwrap();
        assert_eq!(host.state(), SessionState::Closed);

        let handle = host.session_handle();
        assert!(matches!(
            handle.leave(),
            Err(NegotiationError::SessionTerminated { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_is_rejected_without_side_effects() {
        let relay = LocalRelay::new();
        let room_id = relay.create_room("pw").await.unwrap();
        let (mut host, _events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Host, "USER-1"),
            collaborators(&relay, MockAdapter::new(vec![]), RetryScheduler::new()),
            config(),
        );
        host.handle(SessionInput::Start).await.unwrap();
        assert_eq!(
            host.handle(SessionInput::Start).await,
            Err(NegotiationError::AlreadyStarted)
        );
        assert_eq!(host.state(), SessionState::CapturingMedia);

        // без кандидатов offer всё равно уходит
        step_until(&mut host, SessionState::AwaitingRemote).await;
        assert_eq!(host.report().candidates_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_serves_resend_requests() {
        let relay = LocalRelay::new();
        let (host, _host_events) = awaiting_host(
            &relay,
            MockAdapter::new(vec![host_candidate(1)]),
            RetryScheduler::new(),
        )
        .await;
        let room_id = host.session().room_id().to_string();

        let (mut joiner, _events) = NegotiationStateMachine::new(
            Session::new(room_id.clone(), Role::Joiner, "USER-2"),
            collaborators(
                &relay,
                MockAdapter::new(vec![host_candidate(11), host_candidate(12)]),
                RetryScheduler::new(),
            ),
            config(),
        );
        joiner.handle(SessionInput::Start).await.unwrap();
        step_until(&mut joiner, SessionState::Negotiated).await;

        let host_side = relay.channel();
        host_side.connect().await.unwrap();
        host_side
            .send(EventKind::ResendCandidates, json!({ "roomId": room_id }))
            .await
            .unwrap();
        joiner.step().await.unwrap();

        let answers: Vec<_> = relay
            .history()
            .into_iter()
            .filter(|(kind, _)| *kind == EventKind::AnswerCall)
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0], answers[1]);
        assert_eq!(joiner.state(), SessionState::Negotiated);
        assert_eq!(joiner.report().candidates_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_loss_before_negotiation_closes_session() {
        let relay = LocalRelay::new();
        let retry = RetryScheduler::new();
        let (mut host, _events) =
            awaiting_host(&relay, MockAdapter::new(vec![host_candidate(1)]), retry.clone()).await;
        deliver(&relay, &mut host, answer_with(vec![])).await.unwrap();

        relay.disconnect_all();
        step_until(&mut host, SessionState::Closed).await;
        assert!(matches!(
            host.report().error,
            Some(NegotiationError::SignalingUnavailable(_))
        ));
        assert_eq!(retry.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_relay_fails_start() {
        let relay = LocalRelay::new();
        relay.refuse_connections(true);
        let room_id = relay.create_room("pw").await.unwrap();
        let (mut host, _events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Host, "USER-1"),
            collaborators(&relay, MockAdapter::new(vec![]), RetryScheduler::new()),
            config(),
        );
        let err = host.handle(SessionInput::Start).await.unwrap_err();
        assert_eq!(err.kind(), "SignalingUnavailable");
        assert_eq!(host.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn media_failure_closes_session() {
        let relay = LocalRelay::new();
        let adapter = MockAdapter::new(vec![]);
        let mut deps = collaborators(&relay, adapter.clone(), RetryScheduler::new());
        deps.media = Arc::new(FailingMedia);
        let room_id = relay.create_room("pw").await.unwrap();
        let (host, _events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Host, "USER-1"),
            deps,
            config(),
        );

        let report = host.run().await;
        assert_eq!(report.state, SessionState::Closed);
        assert_eq!(
            report.error,
            Some(NegotiationError::MediaAccess("permission denied".into()))
        );
        assert!(adapter.is_closed());
        assert!(relay.history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn joiner_without_offer_gets_room_not_found() {
        let relay = LocalRelay::new();
        let room_id = relay.create_room("pw").await.unwrap();
        let (joiner, mut events) = NegotiationStateMachine::new(
            Session::new(room_id, Role::Joiner, "USER-2"),
            collaborators(&relay, MockAdapter::new(vec![]), RetryScheduler::new()),
            config(),
        );

        let report = joiner.run().await;
        assert_eq!(report.state, SessionState::Closed);
        assert!(matches!(
            &report.error,
            Some(NegotiationError::RoomNotFound(msg)) if msg.ends_with("offer not yet published")
        ));
        assert!(drain_events(&mut events).iter().any(|e| matches!(
            e,
            SessionEvent::Terminated {
                error: Some(NegotiationError::RoomNotFound(_)),
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_answer_is_fatal() {
        let relay = LocalRelay::new();
        let (mut host, _events) = awaiting_host(
            &relay,
            MockAdapter::new(vec![host_candidate(1)]),
            RetryScheduler::new(),
        )
        .await;
        let err = host
            .handle(SessionInput::Signal {
                kind: EventKind::UserAnswer,
                payload: json!({"answer": 42}),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ProtocolError");
        assert_eq!(host.state(), SessionState::Closed);
    }
}
