#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Relay - Real-Time Market Data Fan-Out
//!
//! Holds a single authenticated WebSocket connection to an upstream market
//! data feed and fans per-symbol price ticks out to many downstream
//! WebSocket sessions, each interested in its own subset of symbols. The
//! upstream credentials never leave the relay, and the relay keeps exactly
//! one upstream socket regardless of how many clients are connected.
//!
//! # Layers (inside -> outside)
//!
//! - **Domain**: core types, no I/O
//!   - `streaming`: `Symbol`, `Tick`
//!   - `subscription`: reference-counted symbol interest (`SubscriptionRegistry`)
//!
//! - **Application**: ports and services
//!   - `ports`: `UpstreamControl`, `TickSink`, `TickTransport`, `FeedEvent`
//!   - `services`: `FanoutRouter`, `ClientSession`, `FeedState`
//!
//! - **Infrastructure**: adapters
//!   - `upstream`: the feed connector (auth, heartbeat, reconnect, resync)
//!   - `downstream`: the `/stream` WebSocket server
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Upstream WS <--> UpstreamFeedConnector --events--> FanoutRouter --> SessionQueue --> Client 1..N
//!                        ^                               |
//!                        | subscribe / unsubscribe       | interested_sessions
//!                        |                               v
//!                        +----------------------- SubscriptionRegistry <-- ClientSession interest
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core streaming types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::streaming::{Symbol, SymbolError, Tick};
pub use domain::subscription::{RegistryStats, SessionId, SubscriptionRegistry, UpstreamControl};

// Ports
pub use application::ports::{DeliveryError, EnqueueOutcome, FeedEvent, TickSink, TickTransport};

// Services
pub use application::services::{
    ClientSession, ConnectionState, DispatchReport, FanoutRouter, FeedSnapshot, FeedState,
    InterestDelta, SessionConfig, SessionError, SessionHandle, SessionState, deliver_session,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Credentials, RelayConfig, ServerSettings, SessionSettings, WebSocketSettings,
};

// Upstream connector
pub use infrastructure::upstream::{
    ConnectorConfig, ConnectorError, ConnectorHandle, UpstreamFeedConnector, command_channel,
};

// Downstream server
pub use infrastructure::downstream::{StreamServer, StreamServerError, WireFormat};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
