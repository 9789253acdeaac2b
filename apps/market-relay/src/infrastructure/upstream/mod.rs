//! Upstream Feed Adapters
//!
//! The single WebSocket connection to the upstream market data feed:
//!
//! - **connector**: connection lifecycle, resync and the event sequence
//! - **auth**, **heartbeat**, **reconnect**: handshake, liveness and backoff
//! - **messages**, **codec**: JSON wire format

pub mod auth;
pub mod codec;
pub mod connector;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use auth::{AuthError, AuthHandler, AuthState};
pub use codec::{CodecError, JsonCodec};
pub use connector::{
    CommandReceiver, ConnectorCommand, ConnectorConfig, ConnectorError, ConnectorHandle,
    UpstreamFeedConnector, command_channel,
};
pub use heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
pub use messages::*;
pub use reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
