use super::{EventKind, SignalingChannel, Subscribers, Subscription};
use crate::error::NegotiationError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Кадр на проводе: `{"event": "...", "data": {...}}`
#[derive(Serialize, Deserialize, Debug)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

fn frame(kind: EventKind, payload: Value) -> Result<String, NegotiationError> {
    Ok(serde_json::to_string(&Envelope {
        event: kind.as_str().to_string(),
        data: payload,
    })?)
}

fn parse_frame(text: &str) -> Option<(EventKind, Value)> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Dropping malformed signaling frame: {e}");
            return None;
        }
    };
    match EventKind::parse(&envelope.event) {
        Some(kind) => Some((kind, envelope.data)),
        None => {
            debug!("Ignoring signaling event {}", envelope.event);
            None
        }
    }
}

struct Link {
    outgoing: mpsc::UnboundedSender<Message>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// Сигнальный канал поверх WebSocket
pub struct WsSignalingChannel {
    url: String,
    subscribers: Arc<Mutex<Subscribers>>,
    connected: Arc<AtomicBool>,
    link: Mutex<Option<Link>>,
}

impl WsSignalingChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            subscribers: Arc::new(Mutex::new(Subscribers::default())),
            connected: Arc::new(AtomicBool::new(false)),
            link: Mutex::new(None),
        }
    }

    fn unavailable() -> NegotiationError {
        NegotiationError::SignalingUnavailable("not connected to relay".into())
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn connect(&self) -> Result<(), NegotiationError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| NegotiationError::SignalingUnavailable(format!("{}: {e}", self.url)))?;
        info!("Connected to signaling relay {}", self.url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_sender.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let subscribers = Arc::clone(&self.subscribers);
        let connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some((kind, payload)) = parse_frame(&text) {
                            let delivered = subscribers.lock().dispatch(kind, &payload);
                            debug!("Signaling {kind} delivered to {delivered} subscribers");
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Signaling relay closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Signaling connection error: {e}");
                        break;
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            // подписки получают None
            subscribers.lock().clear();
        });

        self.connected.store(true, Ordering::SeqCst);
        *self.link.lock() = Some(Link {
            outgoing,
            writer,
            reader,
        });
        Ok(())
    }

    async fn send(&self, kind: EventKind, payload: Value) -> Result<(), NegotiationError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        let text = frame(kind, payload)?;
        let link = self.link.lock();
        let link = link.as_ref().ok_or_else(Self::unavailable)?;
        link.outgoing
            .send(Message::Text(text))
            .map_err(|_| Self::unavailable())?;
        debug!("Signaling {kind} queued");
        Ok(())
    }

    fn subscribe(&self, kind: EventKind) -> Result<Subscription, NegotiationError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        Ok(self.subscribers.lock().add(kind))
    }

    async fn disconnect(&self) -> Result<(), NegotiationError> {
        self.connected.store(false, Ordering::SeqCst);
        let link = self.link.lock().take();
        if let Some(link) = link {
            let _ = link.outgoing.send(Message::Close(None));
            link.reader.abort();
            // writer завершится сам после Close
            drop(link.writer);
            info!("Disconnected from signaling relay");
        }
        self.subscribers.lock().clear();
        Ok(())
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.reader.abort();
            link.writer.abort();
        }
    }
}
