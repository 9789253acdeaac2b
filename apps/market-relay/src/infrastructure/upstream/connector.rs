//! Upstream Feed Connector
//!
//! Owns the single WebSocket connection to the upstream market data feed.
//! The connection handle is touched only by the connector's own task;
//! subscribe and unsubscribe requests from other tasks arrive through a
//! command channel ([`ConnectorHandle`]).
//!
//! # Lifecycle
//!
//! 1. Connect and authenticate, bounded by the auth timeout
//! 2. Resync: replay every symbol active in the registry as one subscribe
//! 3. Pump frames, commands and heartbeats until the connection fails
//! 4. Back off (exponential, jittered) and go to 1
//!
//! After `max_attempts` consecutive failures the connector reports the feed
//! unavailable and keeps probing at the maximum backoff delay.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, AuthHandler};
use super::codec::{CodecError, JsonCodec};
use super::heartbeat::{HeartbeatAction, HeartbeatConfig, HeartbeatMonitor};
use super::messages::{SubscriptionRequest, UpstreamMessage};
use super::reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{FeedEvent, UpstreamControl};
use crate::domain::streaming::Symbol;
use crate::domain::subscription::SubscriptionRegistry;
use crate::infrastructure::config::{Credentials, RelayConfig};
use crate::infrastructure::metrics::{self, Side};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the upstream connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The upstream rejected authentication.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Connect and authenticate did not finish in time.
    #[error("handshake not completed within {0:?}")]
    AuthTimeout(Duration),

    /// The upstream closed the socket before authentication completed.
    #[error("upstream closed the connection during handshake")]
    HandshakeClosed,

    /// Connection attempts exhausted.
    #[error("upstream unavailable after {attempts} consecutive failures: {last_error}")]
    UpstreamUnavailable {
        /// Consecutive failed attempts.
        attempts: u32,
        /// The last attempt's failure.
        last_error: String,
    },

    /// A malformed upstream message during the handshake.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(#[from] CodecError),

    /// Too many consecutive malformed messages.
    #[error("{0} consecutive malformed upstream messages")]
    ProtocolErrorThreshold(u32),

    /// No answer to heartbeat pings.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// The connection ended.
    #[error("connection closed")]
    ConnectionClosed,

    /// An outbound request could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// Shutdown was requested.
    #[error("connector cancelled")]
    Cancelled,
}

impl ConnectorError {
    /// Short label for metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "websocket",
            Self::Auth(_) => "auth",
            Self::AuthTimeout(_) => "auth_timeout",
            Self::HandshakeClosed => "handshake_closed",
            Self::UpstreamUnavailable { .. } => "unavailable",
            Self::UpstreamProtocol(_) | Self::ProtocolErrorThreshold(_) => "protocol",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ConnectionClosed => "closed",
            Self::Encode(_) => "encode",
            Self::Cancelled => "cancelled",
        }
    }
}

// =============================================================================
// Command Channel
// =============================================================================

/// Requests delivered to the connector task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorCommand {
    /// Start receiving ticks for a symbol.
    Subscribe(Symbol),
    /// Stop receiving ticks for a symbol.
    Unsubscribe(Symbol),
}

/// Receiving half of the command channel, owned by the connector.
pub type CommandReceiver = mpsc::UnboundedReceiver<ConnectorCommand>;

/// Cloneable, non-blocking sender of connector commands.
///
/// This is the [`UpstreamControl`] the registry is built with.
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    tx: mpsc::UnboundedSender<ConnectorCommand>,
}

impl ConnectorHandle {
    fn send(&self, command: ConnectorCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("Connector stopped, dropping command");
        }
    }
}

impl UpstreamControl for ConnectorHandle {
    fn subscribe(&self, symbol: &Symbol) {
        self.send(ConnectorCommand::Subscribe(symbol.clone()));
    }

    fn unsubscribe(&self, symbol: &Symbol) {
        self.send(ConnectorCommand::Unsubscribe(symbol.clone()));
    }
}

/// Create the command channel linking the registry to the connector.
#[must_use]
pub fn command_channel() -> (ConnectorHandle, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectorHandle { tx }, rx)
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the upstream connector.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// WebSocket URL.
    pub url: String,
    /// API credentials.
    pub credentials: Credentials,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Upper bound on connect + authenticate.
    pub auth_timeout: Duration,
    /// Consecutive malformed messages tolerated before reconnecting.
    pub protocol_error_threshold: u32,
    /// Capacity of the event channel returned by `receive`.
    pub event_buffer: usize,
}

impl ConnectorConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth_timeout: Duration::from_secs(10),
            protocol_error_threshold: 10,
            event_buffer: 1024,
        }
    }

    /// Create configuration from the relay configuration.
    #[must_use]
    pub fn from_relay_config(config: &RelayConfig) -> Self {
        Self {
            url: config.feed_url.clone(),
            credentials: config.credentials.clone(),
            reconnect: ReconnectConfig::from_websocket_settings(&config.websocket),
            heartbeat: HeartbeatConfig::from_websocket_settings(&config.websocket),
            auth_timeout: config.websocket.auth_timeout,
            protocol_error_threshold: config.websocket.protocol_error_threshold,
            event_buffer: config.session.event_buffer,
        }
    }
}

// =============================================================================
// Upstream Feed Connector
// =============================================================================

/// The single upstream connection and its reconnect loop.
pub struct UpstreamFeedConnector {
    config: ConnectorConfig,
    registry: Arc<SubscriptionRegistry>,
    commands: CommandReceiver,
    cancel: CancellationToken,
    codec: JsonCodec,
    policy: ReconnectPolicy,
    connection: Option<WsStream>,
    upstream: HashSet<Symbol>,
    degraded: bool,
}

impl std::fmt::Debug for UpstreamFeedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamFeedConnector")
            .field("url", &self.config.url)
            .field("connected", &self.connection.is_some())
            .field("upstream_symbols", &self.upstream.len())
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

impl UpstreamFeedConnector {
    /// Create a connector. Nothing is opened until [`connect`](Self::connect)
    /// or [`receive`](Self::receive).
    #[must_use]
    pub fn new(
        config: ConnectorConfig,
        registry: Arc<SubscriptionRegistry>,
        commands: CommandReceiver,
        cancel: CancellationToken,
    ) -> Self {
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        Self {
            config,
            registry,
            commands,
            cancel,
            codec: JsonCodec::new(),
            policy,
            connection: None,
            upstream: HashSet::new(),
            degraded: false,
        }
    }

    /// Whether a live, authenticated connection is held.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Symbols currently subscribed on the upstream connection.
    #[must_use]
    pub fn upstream_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<Symbol> = self.upstream.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Connect, authenticate and resync, retrying with backoff.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::UpstreamUnavailable`] once the configured
    /// number of consecutive attempts has failed, or
    /// [`ConnectorError::Cancelled`] if shutdown was requested meanwhile.
    pub async fn connect(&mut self) -> Result<(), ConnectorError> {
        loop {
            let error = match self.attempt().await {
                Ok(()) => {
                    self.policy.reset();
                    self.degraded = false;
                    return Ok(());
                }
                Err(ConnectorError::Cancelled) => return Err(ConnectorError::Cancelled),
                Err(e) => e,
            };

            tracing::warn!(error = %error, "Upstream connection attempt failed");
            metrics::record_websocket_error(Side::Upstream, error.kind());

            match self.policy.next_backoff() {
                Backoff::Retry { attempt, delay } => {
                    tracing::info!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Retrying upstream connection"
                    );
                    if !self.sleep_or_cancel(delay).await {
                        return Err(ConnectorError::Cancelled);
                    }
                }
                Backoff::Exhausted { attempts, .. } => {
                    return Err(ConnectorError::UpstreamUnavailable {
                        attempts,
                        last_error: error.to_string(),
                    });
                }
            }
        }
    }

    /// Subscribe a symbol upstream. A no-op if it already is.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be written.
    pub async fn subscribe(&mut self, symbol: &Symbol) -> Result<(), ConnectorError> {
        self.send_command(ConnectorCommand::Subscribe(symbol.clone()))
            .await
    }

    /// Unsubscribe a symbol upstream. A no-op if it is not subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the request could not be written.
    pub async fn unsubscribe(&mut self, symbol: &Symbol) -> Result<(), ConnectorError> {
        self.send_command(ConnectorCommand::Unsubscribe(symbol.clone()))
            .await
    }

    async fn send_command(&mut self, command: ConnectorCommand) -> Result<(), ConnectorError> {
        let Some(request) = plan_request(&mut self.upstream, command) else {
            return Ok(());
        };
        if let Some(ws) = self.connection.as_mut() {
            send_json(ws, &request).await?;
        }
        Ok(())
    }

    /// Start the connector task and return its event sequence.
    ///
    /// The sequence is infinite until cancellation; connection failures
    /// surface as lifecycle events rather than ending it. Must be called
    /// inside a tokio runtime.
    pub fn receive(self) -> ReceiverStream<FeedEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        tokio::spawn(self.run(tx));
        ReceiverStream::new(rx)
    }

    async fn run(mut self, events: mpsc::Sender<FeedEvent>) {
        tracing::info!(url = %self.config.url, "Upstream connector started");

        let mut backoff_first = false;
        if self.connection.is_some() {
            if !self.announce_connected(&events).await {
                return;
            }
        } else if self.policy.is_exhausted() {
            self.degraded = true;
            metrics::record_upstream_unavailable();
            let attempts = self.policy.attempt_count();
            if !emit(&events, FeedEvent::Unavailable { attempts }).await {
                return;
            }
            backoff_first = true;
        }

        loop {
            if self.connection.is_none() && !self.reconnect(&events, backoff_first).await {
                break;
            }

            match self.pump(&events).await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream connection lost");
                    metrics::record_websocket_error(Side::Upstream, e.kind());
                    self.connection = None;
                    self.upstream.clear();

                    let reason = e.to_string();
                    if !emit(&events, FeedEvent::Disconnected { reason }).await {
                        break;
                    }
                    backoff_first = true;
                }
            }
        }

        tracing::info!("Upstream connector stopped");
    }

    /// Try until connected. Returns `false` on cancellation or when the
    /// event receiver is gone.
    async fn reconnect(&mut self, events: &mpsc::Sender<FeedEvent>, mut backoff_first: bool) -> bool {
        loop {
            if backoff_first {
                let backoff = self.policy.next_backoff();
                let event = match backoff {
                    Backoff::Retry { attempt, delay } => FeedEvent::Reconnecting { attempt, delay },
                    Backoff::Exhausted { attempts, .. } if !self.degraded => {
                        self.degraded = true;
                        tracing::error!(attempts, "Upstream unavailable, probing at max backoff");
                        FeedEvent::Unavailable { attempts }
                    }
                    Backoff::Exhausted { attempts, delay } => FeedEvent::Reconnecting {
                        attempt: attempts,
                        delay,
                    },
                };
                if !emit(events, event).await || !self.sleep_or_cancel(backoff.delay()).await {
                    return false;
                }
            }
            backoff_first = true;

            match self.attempt().await {
                Ok(()) => {
                    self.policy.reset();
                    self.degraded = false;
                    return self.announce_connected(events).await;
                }
                Err(ConnectorError::Cancelled) => return false,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        attempt = self.policy.attempt_count() + 1,
                        "Upstream connection attempt failed"
                    );
                    metrics::record_websocket_error(Side::Upstream, e.kind());
                }
            }
        }
    }

    async fn announce_connected(&self, events: &mpsc::Sender<FeedEvent>) -> bool {
        let symbols = self.upstream.len();
        emit(events, FeedEvent::Connected).await
            && emit(events, FeedEvent::Resubscribed { symbols }).await
    }

    /// One connect + authenticate + resync attempt.
    async fn attempt(&mut self) -> Result<(), ConnectorError> {
        let cancel = self.cancel.clone();
        let timeout = self.config.auth_timeout;

        let mut ws = tokio::select! {
            () = cancel.cancelled() => return Err(ConnectorError::Cancelled),
            result = tokio::time::timeout(timeout, self.handshake()) => {
                result.map_err(|_| ConnectorError::AuthTimeout(timeout))??
            }
        };

        self.resync(&mut ws).await?;
        self.connection = Some(ws);
        Ok(())
    }

    async fn handshake(&self) -> Result<WsStream, ConnectorError> {
        tracing::info!(url = %self.config.url, "Connecting to upstream feed");
        let (mut ws, _response) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let mut auth = AuthHandler::new(self.config.credentials.clone());

        while let Some(frame) = ws.next().await {
            let text = match frame? {
                Message::Text(text) => text,
                Message::Ping(data) => {
                    ws.send(Message::Pong(data)).await?;
                    continue;
                }
                Message::Close(_) => return Err(ConnectorError::HandshakeClosed),
                _ => continue,
            };

            for decoded in self.codec.decode(text.as_str()) {
                match decoded? {
                    UpstreamMessage::Success(success) => {
                        if auth.on_success(&success) {
                            tracing::info!("Upstream feed authenticated");
                            return Ok(ws);
                        }
                        if auth.state().can_authenticate() {
                            let request = auth.create_auth_request();
                            ws.send(Message::Text(request.to_json()?.into())).await?;
                        }
                    }
                    UpstreamMessage::Error(error) => {
                        tracing::error!(code = error.code, msg = %error.msg, "Upstream rejected handshake");
                        return Err(auth.on_error(&error).into());
                    }
                    _ => {}
                }
            }
        }

        Err(ConnectorError::HandshakeClosed)
    }

    /// Replay registry interest on a fresh connection.
    async fn resync(&mut self, ws: &mut WsStream) -> Result<(), ConnectorError> {
        let mut discarded = 0usize;
        while self.commands.try_recv().is_ok() {
            discarded += 1;
        }

        let symbols = self.registry.active_symbols();
        self.upstream = symbols.iter().cloned().collect();

        if !symbols.is_empty() {
            let request = SubscriptionRequest::subscribe().with_trades(symbols.iter().map(Symbol::as_str));
            send_json(ws, &request).await?;
        }

        tracing::info!(
            symbols = symbols.len(),
            discarded_commands = discarded,
            "Upstream interest resynchronized"
        );
        Ok(())
    }

    /// Drive the live connection. `Ok` means stop for good (cancelled or
    /// nobody is listening); `Err` means reconnect.
    async fn pump(&mut self, events: &mpsc::Sender<FeedEvent>) -> Result<(), ConnectorError> {
        let ws = self.connection.take().ok_or(ConnectorError::ConnectionClosed)?;
        let (mut write, mut read) = ws.split();

        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat.clone());

        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(command) = self.commands.recv() => {
                    if let Some(request) = plan_request(&mut self.upstream, command) {
                        send_json(&mut write, &request).await?;
                    }
                }
                () = tokio::time::sleep_until(Instant::from_std(heartbeat.next_check())) => {
                    match heartbeat.on_tick() {
                        HeartbeatAction::SendPing => {
                            write.send(Message::Ping(Vec::new().into())).await?;
                        }
                        HeartbeatAction::Timeout => return Err(ConnectorError::HeartbeatTimeout),
                        HeartbeatAction::Idle => {}
                    }
                }
                frame = read.next() => {
                    let frame = frame.ok_or(ConnectorError::ConnectionClosed)??;
                    heartbeat.record_activity();

                    match frame {
                        Message::Text(text) => {
                            if !self.handle_text(text.as_str(), events, &mut consecutive_errors).await? {
                                return Ok(());
                            }
                        }
                        Message::Binary(data) => {
                            let event = self.protocol_error(
                                &mut consecutive_errors,
                                format!("unexpected binary frame ({} bytes)", data.len()),
                            )?;
                            if !emit(events, event).await {
                                return Ok(());
                            }
                        }
                        Message::Ping(data) => write.send(Message::Pong(data)).await?,
                        Message::Close(close) => {
                            tracing::info!(frame = ?close, "Upstream sent close frame");
                            return Err(ConnectorError::ConnectionClosed);
                        }
                        Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Forward one text frame. Returns `false` if the event receiver is gone.
    async fn handle_text(
        &self,
        text: &str,
        events: &mpsc::Sender<FeedEvent>,
        consecutive_errors: &mut u32,
    ) -> Result<bool, ConnectorError> {
        for decoded in self.codec.decode(text) {
            let event = match decoded {
                Ok(UpstreamMessage::Trade(trade)) => match trade.to_tick() {
                    Ok(tick) => {
                        *consecutive_errors = 0;
                        FeedEvent::Tick(tick)
                    }
                    Err(e) => self.protocol_error(consecutive_errors, format!("invalid trade: {e}"))?,
                },
                Ok(UpstreamMessage::Subscription(subscription)) => {
                    *consecutive_errors = 0;
                    FeedEvent::Subscribed {
                        symbols: subscription.trades,
                    }
                }
                Ok(UpstreamMessage::Error(error)) => {
                    *consecutive_errors = 0;
                    tracing::error!(code = error.code, msg = %error.msg, "Upstream error message");
                    metrics::record_websocket_error(Side::Upstream, "server_error");
                    continue;
                }
                Ok(UpstreamMessage::Success(_) | UpstreamMessage::Ignored(_)) => {
                    *consecutive_errors = 0;
                    continue;
                }
                Err(e) => self.protocol_error(consecutive_errors, e.to_string())?,
            };

            if !emit(events, event).await {
                return Ok(false);
            }
        }

        Ok(true)
    }

    fn protocol_error(
        &self,
        consecutive_errors: &mut u32,
        message: String,
    ) -> Result<FeedEvent, ConnectorError> {
        *consecutive_errors += 1;
        if *consecutive_errors > self.config.protocol_error_threshold {
            return Err(ConnectorError::ProtocolErrorThreshold(*consecutive_errors));
        }
        tracing::debug!(
            error = %message,
            consecutive = *consecutive_errors,
            "Malformed upstream message"
        );
        Ok(FeedEvent::ProtocolError(message))
    }

    async fn sleep_or_cancel(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// Update the subscribed set and build the wire request, or `None` if the
/// command would not change anything.
fn plan_request(
    upstream: &mut HashSet<Symbol>,
    command: ConnectorCommand,
) -> Option<SubscriptionRequest> {
    match command {
        ConnectorCommand::Subscribe(symbol) => {
            let request = SubscriptionRequest::subscribe().with_trades([symbol.as_str()]);
            upstream.insert(symbol).then_some(request)
        }
        ConnectorCommand::Unsubscribe(symbol) => upstream
            .remove(&symbol)
            .then(|| SubscriptionRequest::unsubscribe().with_trades([symbol.as_str()])),
    }
}

async fn send_json<W, T>(write: &mut W, value: &T) -> Result<(), ConnectorError>
where
    W: Sink<Message, Error = WsError> + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value)?;
    write.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn emit(events: &mpsc::Sender<FeedEvent>, event: FeedEvent) -> bool {
    events.send(event).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::WebSocketSettings;

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn credentials() -> Credentials {
        Credentials::new("key".to_string(), "secret".to_string())
    }

    #[test]
    fn handle_sends_commands() {
        let (handle, mut rx) = command_channel();
        handle.subscribe(&sym("AAPL"));
        handle.unsubscribe(&sym("AAPL"));

        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectorCommand::Subscribe(sym("AAPL"))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ConnectorCommand::Unsubscribe(sym("AAPL"))
        );
    }

    #[test]
    fn handle_survives_stopped_connector() {
        let (handle, rx) = command_channel();
        drop(rx);
        handle.subscribe(&sym("AAPL"));
    }

    #[test]
    fn plan_request_is_idempotent() {
        let mut upstream = HashSet::new();

        let first = plan_request(&mut upstream, ConnectorCommand::Subscribe(sym("AAPL")));
        assert_eq!(
            first,
            Some(SubscriptionRequest::subscribe().with_trades(["AAPL"]))
        );
        assert!(plan_request(&mut upstream, ConnectorCommand::Subscribe(sym("AAPL"))).is_none());

        assert!(plan_request(&mut upstream, ConnectorCommand::Unsubscribe(sym("MSFT"))).is_none());
        assert_eq!(
            plan_request(&mut upstream, ConnectorCommand::Unsubscribe(sym("AAPL"))),
            Some(SubscriptionRequest::unsubscribe().with_trades(["AAPL"]))
        );
        assert!(upstream.is_empty());
    }

    #[test]
    fn config_from_relay_config() {
        let relay = RelayConfig::from_lookup(|key| match key {
            "UPSTREAM_API_KEY" => Some("k".to_string()),
            "UPSTREAM_API_SECRET" => Some("s".to_string()),
            "RELAY_PROTOCOL_ERROR_THRESHOLD" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();

        let config = ConnectorConfig::from_relay_config(&relay);
        assert_eq!(config.url, relay.feed_url);
        assert_eq!(config.protocol_error_threshold, 3);
        assert_eq!(config.auth_timeout, WebSocketSettings::default().auth_timeout);
        assert_eq!(config.reconnect.max_attempts, 10);
    }

    fn unreachable_connector(max_attempts: u32) -> (UpstreamFeedConnector, ConnectorHandle) {
        let (handle, rx) = command_channel();
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(handle.clone())));
        let mut config = ConnectorConfig::new("ws://127.0.0.1:1/feed", credentials());
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        };
        config.auth_timeout = Duration::from_secs(2);
        (
            UpstreamFeedConnector::new(config, registry, rx, CancellationToken::new()),
            handle,
        )
    }

    #[tokio::test]
    async fn connect_reports_unavailable_after_max_attempts() {
        let (mut connector, _handle) = unreachable_connector(3);

        let err = connector.connect().await.unwrap_err();
        assert!(
            matches!(err, ConnectorError::UpstreamUnavailable { attempts: 3, .. }),
            "{err}"
        );
        assert!(!connector.is_connected());
    }

    #[tokio::test]
    async fn receive_reports_degraded_state_and_keeps_probing() {
        let (connector, _handle) = unreachable_connector(2);
        let mut events = connector.receive();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(event);
        }

        assert!(matches!(seen[0], FeedEvent::Reconnecting { attempt: 1, .. }));
        assert_eq!(seen[1], FeedEvent::Unavailable { attempts: 2 });
        assert!(matches!(seen[2], FeedEvent::Reconnecting { attempt: 3, .. }));
        assert!(matches!(seen[3], FeedEvent::Reconnecting { attempt: 4, .. }));
    }

    #[tokio::test]
    async fn subscribe_without_connection_tracks_locally() {
        let (mut connector, _handle) = unreachable_connector(1);
        connector.subscribe(&sym("aapl")).await.unwrap();
        connector.subscribe(&sym("AAPL")).await.unwrap();
        assert_eq!(connector.upstream_symbols(), vec![sym("AAPL")]);

        connector.unsubscribe(&sym("AAPL")).await.unwrap();
        assert!(connector.upstream_symbols().is_empty());
    }
}
