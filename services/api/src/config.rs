use live_bridge_core::{RetryPolicy, SessionPolicy, TranslatorDefaults, translate::DEFAULT_MODEL};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub gemini_api_key: String,
    pub live_model: String,
    pub gemini_ws_url: Option<String>,
    pub log_level: Level,
    pub idle_timeout: Option<Duration>,
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub flush_timeout: Duration,
    pub max_sessions: Option<usize>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("live_model", &self.live_model)
            .field("gemini_ws_url", &self.gemini_ws_url)
            .field("log_level", &self.log_level)
            .field("idle_timeout", &self.idle_timeout)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("max_sessions", &self.max_sessions)
            .finish_non_exhaustive()
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(None),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Tests control the environment themselves.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var::<SocketAddr>("BIND_ADDRESS")?
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8000)));

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let live_model =
            std::env::var("GEMINI_LIVE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let gemini_ws_url = std::env::var("GEMINI_WS_URL").ok();

        let log_level = parse_var::<Level>("RUST_LOG")?.unwrap_or(Level::INFO);

        let idle_timeout = parse_var::<u64>("SESSION_IDLE_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let retry_max_attempts = parse_var::<u32>("UPSTREAM_RETRY_MAX_ATTEMPTS")?.unwrap_or(0);
        let retry_initial_delay = Duration::from_millis(
            parse_var::<u64>("UPSTREAM_RETRY_INITIAL_DELAY_MS")?.unwrap_or(500),
        );
        let retry_max_delay = Duration::from_millis(
            parse_var::<u64>("UPSTREAM_RETRY_MAX_DELAY_MS")?.unwrap_or(8000),
        );
        let flush_timeout = Duration::from_millis(
            parse_var::<u64>("OUTBOUND_FLUSH_TIMEOUT_MS")?.unwrap_or(2000),
        );
        let max_sessions = parse_var::<usize>("MAX_SESSIONS")?;

        Ok(Self {
            bind_address,
            gemini_api_key,
            live_model,
            gemini_ws_url,
            log_level,
            idle_timeout,
            retry_max_attempts,
            retry_initial_delay,
            retry_max_delay,
            flush_timeout,
            max_sessions,
        })
    }

    /// Session lifecycle policy derived from this configuration.
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            retry: RetryPolicy {
                max_retries: self.retry_max_attempts,
                initial_delay: self.retry_initial_delay,
                max_delay: self.retry_max_delay,
                ..Default::default()
            },
            idle_timeout: self.idle_timeout,
            flush_timeout: self.flush_timeout,
            max_sessions: self.max_sessions,
            ..Default::default()
        }
    }

    pub fn translator_defaults(&self) -> TranslatorDefaults {
        TranslatorDefaults::new(self.live_model.clone())
    }
}
