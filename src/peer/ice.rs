use crate::error::NegotiationError;
use crate::peer::types::{IceCandidate, IceServer, ServerConfig};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::time::Duration;

/// Публичные STUN серверы, если провайдер недоступен
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<IceServer>> = Lazy::new(|| {
    vec![IceServer::stun(&[
        "stun:stun.l.google.com:19302",
        "stun:stun.l.google.com:5349",
        "stun:stun1.l.google.com:3478",
        "stun:stun1.l.google.com:5349",
        "stun:stun2.l.google.com:19302",
        "stun:stun2.l.google.com:5349",
        "stun:stun3.l.google.com:3478",
        "stun:stun3.l.google.com:5349",
        "stun:stun4.l.google.com:19302",
        "stun:stun4.l.google.com:5349",
    ])]
});

const XIRSYS_BASE: &str = "https://global.xirsys.net/_turn";
const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(10);

/// Источник ICE серверов для сессии
#[async_trait]
pub trait IceServerProvider: Send + Sync {
    async fn fetch(&self) -> Result<Vec<IceServer>, NegotiationError>;
}

/// Фиксированный список серверов (в т.ч. пользовательский)
#[derive(Debug, Clone, Default)]
pub struct StaticIceServers {
    servers: Vec<IceServer>,
}

impl StaticIceServers {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }

    pub fn defaults() -> Self {
        Self::new(DEFAULT_ICE_SERVERS.clone())
    }

    /// Пользовательские серверы с проверкой
    pub fn from_server_configs(configs: &[ServerConfig]) -> Result<Self, NegotiationError> {
        debug!("Setting {} custom ICE servers", configs.len());
        let mut servers = Vec::with_capacity(configs.len());
        for config in configs {
            config.validate()?;
            servers.push(IceServer {
                urls: vec![add_ice_url_scheme(config)],
                username: config.username.clone(),
                credential: config.credential.clone(),
            });
        }
        Ok(Self::new(servers))
    }
}

#[async_trait]
impl IceServerProvider for StaticIceServers {
    async fn fetch(&self) -> Result<Vec<IceServer>, NegotiationError> {
        Ok(self.servers.clone())
    }
}

#[derive(Deserialize)]
struct XirsysResponse {
    v: Option<XirsysValue>,
}

#[derive(Deserialize)]
struct XirsysValue {
    #[serde(rename = "iceServers")]
    ice_servers: Option<IceServer>,
}

/// TURN/STUN учётные данные от Xirsys
#[derive(Debug, Clone)]
pub struct XirsysProvider {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    api_key: String,
}

impl XirsysProvider {
    pub fn new(app_name: &str, user: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self::with_endpoint(format!("{XIRSYS_BASE}/{app_name}"), user, api_key)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        user: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            user: user.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl IceServerProvider for XirsysProvider {
    async fn fetch(&self) -> Result<Vec<IceServer>, NegotiationError> {
        let response = self
            .client
            .put(&self.endpoint)
            .basic_auth(&self.user, Some(&self.api_key))
            .json(&serde_json::json!({ "format": "urls" }))
            .timeout(PROVISIONING_TIMEOUT)
            .send()
            .await
            .map_err(|e| NegotiationError::Provisioning(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NegotiationError::Provisioning(format!(
                "provider answered {}",
                response.status()
            )));
        }

        let body: XirsysResponse = response
            .json()
            .await
            .map_err(|e| NegotiationError::Provisioning(e.to_string()))?;

        body.v
            .and_then(|v| v.ice_servers)
            .map(|server| vec![server])
            .ok_or_else(|| NegotiationError::Provisioning("response has no iceServers".into()))
    }
}

/// Серверы для новой сессии; при любой ошибке - STUN по умолчанию
pub async fn resolve_ice_servers(provider: &dyn IceServerProvider) -> Vec<IceServer> {
    match provider.fetch().await {
        Ok(servers) if !servers.is_empty() => {
            info!("Using {} provisioned ICE server entries", servers.len());
            servers
        }
        Ok(_) => {
            warn!("ICE provider returned no servers, falling back to default STUN set");
            DEFAULT_ICE_SERVERS.clone()
        }
        Err(e) => {
            warn!("{e}; falling back to default STUN set");
            DEFAULT_ICE_SERVERS.clone()
        }
    }
}

/// Сводка по типам кандидатов
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host, stats.srflx, stats.relay
    );

    if stats.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    stats
}
