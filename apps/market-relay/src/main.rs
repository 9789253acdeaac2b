//! Market Relay Binary
//!
//! Starts the market data fan-out relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `UPSTREAM_API_KEY`: upstream feed API key
//! - `UPSTREAM_API_SECRET`: upstream feed API secret
//!
//! ## Optional
//! - `UPSTREAM_FEED_URL`: upstream WebSocket URL (default: IEX trades)
//! - `RELAY_STREAM_PORT`: downstream WebSocket port (default: 8081)
//! - `RELAY_HEALTH_PORT`: health check HTTP port (default: 8082)
//! - `RELAY_SESSION_QUEUE_CAPACITY`: per-session queue size (default: 256)
//! - `RELAY_MAX_SYMBOLS_PER_SESSION`: per-session symbol limit (default: 500)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: market-relay)
//! - `RUST_LOG`: Log level (default: info)
//!
//! See `RelayConfig` for the reconnect, heartbeat and protocol settings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_relay::infrastructure::downstream::StreamServer;
use market_relay::infrastructure::health::{HealthServer, HealthServerState};
use market_relay::infrastructure::telemetry;
use market_relay::infrastructure::upstream::{
    ConnectorConfig, ConnectorError, UpstreamFeedConnector, command_channel,
};
use market_relay::{FanoutRouter, RelayConfig, SessionConfig, SubscriptionRegistry, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting market relay");

    let _metrics_handle = init_metrics().context("failed to initialize metrics")?;

    let config = RelayConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Registry -> connector commands; connector -> router events.
    let (connector_handle, commands) = command_channel();
    let registry = Arc::new(SubscriptionRegistry::new(Arc::new(connector_handle)));
    let router = Arc::new(FanoutRouter::new(
        Arc::clone(&registry),
        SessionConfig::from(&config.session),
    ));
    let mut connector = UpstreamFeedConnector::new(
        ConnectorConfig::from_relay_config(&config),
        registry,
        commands,
        shutdown_token.clone(),
    );

    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&router),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let stream_server = StreamServer::new(
        config.server.stream_port,
        Arc::clone(&router),
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = stream_server.run().await {
            tracing::error!(error = %e, "Stream server error");
        }
    });

    let relay_router = Arc::clone(&router);
    let relay_shutdown = shutdown_token.clone();
    let relay = tokio::spawn(async move {
        match connector.connect().await {
            Ok(()) => {}
            Err(ConnectorError::Cancelled) => return,
            Err(e) => {
                tracing::error!(error = %e, "Upstream unavailable at startup, continuing degraded");
            }
        }
        relay_router.run(connector.receive(), relay_shutdown).await;
    });

    tracing::info!("Market relay ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, relay).await.is_err() {
        tracing::warn!("Relay did not stop within the shutdown timeout");
        router.close_all();
    }

    tracing::info!("Market relay stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        feed_url = %config.feed_url,
        stream_port = config.server.stream_port,
        health_port = config.server.health_port,
        queue_capacity = config.session.queue_capacity,
        max_symbols = config.session.max_symbols,
        "Configuration loaded"
    );
    tracing::debug!(
        heartbeat_interval_secs = config.websocket.heartbeat_interval.as_secs(),
        max_reconnect_attempts = config.websocket.max_reconnect_attempts,
        protocol_error_threshold = config.websocket.protocol_error_threshold,
        "Upstream settings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
