//! Configuration Module
//!
//! Configuration loading for the relay service.

mod settings;

pub use settings::{
    ConfigError, Credentials, DEFAULT_FEED_URL, RelayConfig, ServerSettings, SessionSettings,
    WebSocketSettings,
};
