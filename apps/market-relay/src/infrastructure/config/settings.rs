//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::application::services::SessionConfig;
use crate::application::services::session::{DEFAULT_MAX_SYMBOLS, DEFAULT_QUEUE_CAPACITY};

/// Default upstream feed endpoint (IEX trades).
pub const DEFAULT_FEED_URL: &str = "wss://stream.data.alpaca.markets/v2/iex";

/// Upstream API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String, api_secret: String) -> Self {
        Self {
            api_key,
            api_secret,
        }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Get the API secret.
    #[must_use]
    pub fn api_secret(&self) -> &str {
        &self.api_secret
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .field("api_secret", &"[REDACTED]")
            .finish()
    }
}

/// Upstream WebSocket connection settings.
#[derive(Debug, Clone)]
pub struct WebSocketSettings {
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Heartbeat timeout before considering connection dead.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Consecutive failures before the feed is reported unavailable.
    pub max_reconnect_attempts: u32,
    /// Upper bound on the connect + authenticate handshake.
    pub auth_timeout: Duration,
    /// Consecutive malformed messages tolerated before reconnecting.
    pub protocol_error_threshold: u32,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            max_reconnect_attempts: 10,
            auth_timeout: Duration::from_secs(10),
            protocol_error_threshold: 10,
        }
    }
}

/// Downstream session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Outbound queue capacity per session.
    pub queue_capacity: usize,
    /// Maximum symbols per session.
    pub max_symbols: usize,
    /// Buffer between the upstream connector and the router.
    pub event_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_symbols: DEFAULT_MAX_SYMBOLS,
            event_buffer: 1024,
        }
    }
}

impl From<&SessionSettings> for SessionConfig {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity,
            max_symbols: settings.max_symbols,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Downstream WebSocket port.
    pub stream_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            stream_port: 8081,
            health_port: 8082,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream feed WebSocket URL.
    pub feed_url: String,
    /// API credentials.
    pub credentials: Credentials,
    /// Server port settings.
    pub server: ServerSettings,
    /// Upstream WebSocket settings.
    pub websocket: WebSocketSettings,
    /// Downstream session settings.
    pub session: SessionSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if required keys are missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = required(&lookup, "UPSTREAM_API_KEY")?;
        let api_secret = required(&lookup, "UPSTREAM_API_SECRET")?;

        let feed_url = lookup("UPSTREAM_FEED_URL")
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FEED_URL.to_string());

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            stream_port: parse_or(&lookup, "RELAY_STREAM_PORT", server_defaults.stream_port),
            health_port: parse_or(&lookup, "RELAY_HEALTH_PORT", server_defaults.health_port),
        };

        let ws_defaults = WebSocketSettings::default();
        let websocket = WebSocketSettings {
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "RELAY_HEARTBEAT_INTERVAL_SECS",
                ws_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                &lookup,
                "RELAY_HEARTBEAT_TIMEOUT_SECS",
                ws_defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "RELAY_RECONNECT_DELAY_INITIAL_MS",
                ws_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "RELAY_RECONNECT_DELAY_MAX_SECS",
                ws_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "RELAY_RECONNECT_DELAY_MULTIPLIER",
                ws_defaults.reconnect_delay_multiplier,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "RELAY_MAX_RECONNECT_ATTEMPTS",
                ws_defaults.max_reconnect_attempts,
            ),
            auth_timeout: parse_duration_secs(
                &lookup,
                "RELAY_AUTH_TIMEOUT_SECS",
                ws_defaults.auth_timeout,
            ),
            protocol_error_threshold: parse_or(
                &lookup,
                "RELAY_PROTOCOL_ERROR_THRESHOLD",
                ws_defaults.protocol_error_threshold,
            ),
        };

        let session_defaults = SessionSettings::default();
        let session = SessionSettings {
            queue_capacity: parse_or(
                &lookup,
                "RELAY_SESSION_QUEUE_CAPACITY",
                session_defaults.queue_capacity,
            ),
            max_symbols: parse_or(
                &lookup,
                "RELAY_MAX_SYMBOLS_PER_SESSION",
                session_defaults.max_symbols,
            ),
            event_buffer: parse_or(&lookup, "RELAY_EVENT_BUFFER", session_defaults.event_buffer),
        };

        Ok(Self {
            feed_url,
            credentials: Credentials::new(api_key, api_secret),
            server,
            websocket,
            session,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
