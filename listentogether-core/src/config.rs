use std::{env, path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;
use url::Url;

/// The configuration of a listentogether client
#[derive(Debug, Clone)]
pub struct Config {
    /// The base url of the server, used for the real-time connection
    pub server_url: String,
    /// The base url of the REST api
    pub api_url: String,
    /// How long a connection attempt may take before it is rejected
    pub connect_timeout: Duration,
    /// How many times to try to reconnect after an unexpected disconnect
    pub reconnection_attempts: u32,
    /// How long to wait between reconnection attempts
    pub reconnection_delay: Duration,
    /// How long a stored session stays valid
    pub session_ttl: Duration,
    /// Where local state such as the session is persisted
    pub storage_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} must be a number, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("Invalid server url {0:?}: {1}")]
    InvalidUrl(String, String),
}

impl Config {
    pub const SERVER_URL_VAR: &'static str = "LISTENTOGETHER_SERVER_URL";
    pub const API_URL_VAR: &'static str = "LISTENTOGETHER_API_URL";
    pub const CONNECT_TIMEOUT_VAR: &'static str = "LISTENTOGETHER_CONNECT_TIMEOUT_MS";
    pub const RECONNECTION_ATTEMPTS_VAR: &'static str = "LISTENTOGETHER_RECONNECTION_ATTEMPTS";
    pub const RECONNECTION_DELAY_VAR: &'static str = "LISTENTOGETHER_RECONNECTION_DELAY_MS";
    pub const STORAGE_DIR_VAR: &'static str = "LISTENTOGETHER_STORAGE_DIR";

    /// Builds a config from the defaults, overridden by any `LISTENTOGETHER_*` environment variables.
    ///
    /// When only the server url is given, the api url is derived from it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(server_url) = env::var(Self::SERVER_URL_VAR) {
            config.api_url = format!("{}/api", server_url.trim_end_matches('/'));
            config.server_url = server_url;
        }

        if let Ok(api_url) = env::var(Self::API_URL_VAR) {
            config.api_url = api_url;
        }

        if let Some(ms) = number_from_env(Self::CONNECT_TIMEOUT_VAR)? {
            config.connect_timeout = Duration::from_millis(ms);
        }

        if let Some(attempts) = number_from_env(Self::RECONNECTION_ATTEMPTS_VAR)? {
            config.reconnection_attempts = attempts;
        }

        if let Some(ms) = number_from_env(Self::RECONNECTION_DELAY_VAR)? {
            config.reconnection_delay = Duration::from_millis(ms);
        }

        if let Ok(dir) = env::var(Self::STORAGE_DIR_VAR) {
            config.storage_dir = dir.into();
        }

        // Fail early instead of on the first connection attempt
        config.socket_url()?;

        Ok(config)
    }

    /// Returns the websocket endpoint of the real-time server.
    pub fn socket_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidUrl(self.server_url.clone(), reason);

        let mut url = Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        };

        url.set_scheme(scheme)
            .map_err(|_| invalid("cannot change scheme".to_string()))?;
        url.set_path("/socket.io/");
        url.set_query(Some("EIO=4&transport=websocket"));

        Ok(url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:3000".to_string(),
            api_url: "http://localhost:3000/api".to_string(),
            connect_timeout: Duration::from_millis(5000),
            reconnection_attempts: 5,
            reconnection_delay: Duration::from_millis(1000),
            // Sessions are resumable for a day
            session_ttl: Duration::from_secs(24 * 60 * 60),
            storage_dir: PathBuf::from(".listentogether"),
        }
    }
}

fn number_from_env<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => parse_number(var, value).map(Some),
        Err(_) => Ok(None),
    }
}

/// Parses into the target type directly, so values that do not fit are rejected.
fn parse_number<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber { var, value })
}
