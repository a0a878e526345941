// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::NegotiationError;
use crate::peer::types::ServerConfig;
use crate::utils::websocket_url;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Учётные данные Xirsys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnCredentials {
    pub app_name: String,
    pub user: String,
    pub api_key: String,
}

/// Параметры одной сессии согласования
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationConfig {
    pub retry_delay: Duration,
    /// Сколько пустых ответов допускается до Failed
    pub max_retries: u32,
    pub relay_only: bool,
    pub capture_audio: bool,
    pub capture_video: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            relay_only: false,
            capture_audio: true,
            capture_video: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server_url: String,
    pub signaling_url: String,
    pub turn: Option<TurnCredentials>,
    /// Непустой список заменяет провайдера TURN
    pub ice_servers: Vec<ServerConfig>,
    pub negotiation: NegotiationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            signaling_url: websocket_url(DEFAULT_SERVER_URL),
            turn: None,
            ice_servers: Vec::new(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, NegotiationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Разбор из произвольного источника ключей (окружение, тесты)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, NegotiationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Config::default();

        if let Some(url) = var("SERVER_URL") {
            config.signaling_url = websocket_url(&url);
            config.server_url = url;
        }
        if let Some(url) = var("SIGNALING_URL") {
            config.signaling_url = url;
        }

        config.turn = match (
            var("TURN_APP_NAME"),
            var("TURN_USER_NAME"),
            var("TURN_API_KEY"),
        ) {
            (Some(app_name), Some(user), Some(api_key)) => Some(TurnCredentials {
                app_name,
                user,
                api_key,
            }),
            (None, None, None) => None,
            _ => {
                return Err(NegotiationError::Config(
                    "TURN_APP_NAME, TURN_USER_NAME and TURN_API_KEY must be set together".into(),
                ))
            }
        };

        if let Some(raw) = var("ROOMCALL_ICE_SERVERS") {
            let servers: Vec<ServerConfig> = serde_json::from_str(&raw)
                .map_err(|e| NegotiationError::Config(format!("ROOMCALL_ICE_SERVERS: {e}")))?;
            for server in &servers {
                server.validate()?;
            }
            config.ice_servers = servers;
        }

        if let Some(raw) = var("ROOMCALL_RETRY_DELAY_MS") {
            let ms = parse_number::<u64>("ROOMCALL_RETRY_DELAY_MS", &raw)?;
            config.negotiation.retry_delay = Duration::from_millis(ms);
        }
        if let Some(raw) = var("ROOMCALL_MAX_RETRIES") {
            config.negotiation.max_retries = parse_number("ROOMCALL_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = var("ROOMCALL_RELAY_ONLY") {
            config.negotiation.relay_only = parse_flag("ROOMCALL_RELAY_ONLY", &raw)?;
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, NegotiationError> {
    raw.trim()
        .parse()
        .map_err(|_| NegotiationError::Config(format!("{key}: expected a number, got {raw:?}")))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, NegotiationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(NegotiationError::Config(format!(
            "{key}: expected a boolean, got {raw:?}"
        ))),
    }
}
