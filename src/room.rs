use crate::error::NegotiationError;
use crate::peer::types::SessionDescription;
use async_trait::async_trait;
use log::{debug, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Опубликованное хостом предложение комнаты
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub offer: SessionDescription,
    pub candidates: Vec<String>,
    pub display_name: Option<String>,
}

/// Сервис комнат: создание, вход по паролю, получение offer
#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn create_room(&self, password: &str) -> Result<String, NegotiationError>;

    /// Неверный пароль неотличим от отсутствующей комнаты
    async fn join_room(&self, room_id: &str, password: &str) -> Result<String, NegotiationError>;

    async fn fetch_room_info(&self, room_id: &str) -> Result<RoomInfo, NegotiationError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest<'a> {
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JoinRoomRequest<'a> {
    room_id: &'a str,
    password: &'a str,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RoomIdResponse {
    #[serde(default)]
    room_id: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RoomInfoResponse {
    #[serde(default)]
    offer: Option<SessionDescription>,
    #[serde(default)]
    candidates: Vec<String>,
    #[serde(default, alias = "userName")]
    display_name: Option<String>,
}

/// Комната есть, но хост ещё не опубликовал offer
pub(crate) fn offer_not_published(room_id: &str) -> NegotiationError {
    NegotiationError::RoomNotFound(format!("{room_id}: offer not yet published"))
}

impl RoomInfoResponse {
    fn into_info(self, room_id: &str) -> Result<RoomInfo, NegotiationError> {
        let offer = self.offer.ok_or_else(|| offer_not_published(room_id))?;
        Ok(RoomInfo {
            offer,
            candidates: self.candidates,
            display_name: self.display_name,
        })
    }
}

/// HTTP клиент сервиса комнат
#[derive(Debug, Clone)]
pub struct HttpRoomRepository {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRoomRepository {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn room_id_from(
        response: reqwest::Response,
        room_hint: &str,
    ) -> Result<String, NegotiationError> {
        check_status(response.status(), room_hint)?;
        let body: RoomIdResponse = response
            .json()
            .await
            .map_err(|e| NegotiationError::RoomService(e.to_string()))?;
        body.room_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NegotiationError::RoomNotFound(room_hint.to_string()))
    }
}

fn check_status(status: StatusCode, room_id: &str) -> Result<(), NegotiationError> {
    if status == StatusCode::NOT_FOUND {
        return Err(NegotiationError::RoomNotFound(room_id.to_string()));
    }
    if !status.is_success() {
        return Err(NegotiationError::RoomService(format!(
            "room service answered {status}"
        )));
    }
    Ok(())
}

fn transport(err: reqwest::Error) -> NegotiationError {
    NegotiationError::RoomService(err.to_string())
}

#[async_trait]
impl RoomRepository for HttpRoomRepository {
    async fn create_room(&self, password: &str) -> Result<String, NegotiationError> {
        let response = self
            .client
            .post(self.url("create-room"))
            .json(&CreateRoomRequest { password })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        let room_id = Self::room_id_from(response, "").await?;
        info!("Room {room_id} created");
        Ok(room_id)
    }

    async fn join_room(&self, room_id: &str, password: &str) -> Result<String, NegotiationError> {
        let response = self
            .client
            .post(self.url("join-room"))
            .json(&JoinRoomRequest { room_id, password })
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        Self::room_id_from(response, room_id).await
    }

    async fn fetch_room_info(&self, room_id: &str) -> Result<RoomInfo, NegotiationError> {
        debug!("Fetching offer for room {room_id}");
        let response = self
            .client
            .get(self.url(&format!("room-info/{room_id}")))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(transport)?;
        check_status(response.status(), room_id)?;
        let body: RoomInfoResponse = response
            .json()
            .await
            .map_err(|e| NegotiationError::RoomService(e.to_string()))?;
        body.into_info(room_id)
    }
}
