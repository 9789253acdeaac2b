//! Downstream WebSocket Server
//!
//! Serves `GET /stream`. Each connection becomes one [`ClientSession`]
//! driven by two tasks:
//!
//! - the inbound reader, which owns the session and applies interest updates
//! - the outbound delivery loop ([`deliver_session`]), which drains the
//!   session's queue into a [`WebSocketTransport`]
//!
//! Either side ending closes the session. Acknowledgements and ticks share
//! the socket, so a tick for a new symbol may arrive before its `subscribed`
//! acknowledgement.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::{Router, routing::get};
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::messages::{ClientAction, ClientRequest, EncodedFrame, ServerMessage, WireFormat};
use crate::application::ports::{DeliveryError, TickTransport};
use crate::application::services::{ClientSession, FanoutRouter, deliver_session};
use crate::domain::streaming::{Symbol, Tick};
use crate::infrastructure::metrics::{self, Side};

// =============================================================================
// Errors
// =============================================================================

/// Stream server errors.
#[derive(Debug, thiserror::Error)]
pub enum StreamServerError {
    /// Failed to bind to port.
    #[error("failed to bind stream server to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("stream server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Transport
// =============================================================================

impl From<EncodedFrame> for Message {
    fn from(frame: EncodedFrame) -> Self {
        match frame {
            EncodedFrame::Text(text) => Self::Text(text.into()),
            EncodedFrame::Binary(bytes) => Self::Binary(bytes.into()),
        }
    }
}

/// [`TickTransport`] over the write half of a WebSocket.
///
/// The sink is shared with the inbound reader, which writes replies.
pub struct WebSocketTransport<S> {
    sink: Arc<Mutex<S>>,
    format: WireFormat,
}

impl<S> WebSocketTransport<S> {
    /// Wrap a shared sink.
    #[must_use]
    pub const fn new(sink: Arc<Mutex<S>>, format: WireFormat) -> Self {
        Self { sink, format }
    }
}

impl<S> std::fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> TickTransport for WebSocketTransport<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    async fn deliver(&mut self, tick: &Tick) -> Result<(), DeliveryError> {
        let frame = self
            .format
            .encode(&ServerMessage::from(tick))
            .map_err(|e| DeliveryError::Encode(e.to_string()))?;

        let mut sink = self.sink.lock().await;
        sink.send(frame.into())
            .await
            .map_err(|e| DeliveryError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::trace!(error = %e, "Ignoring error closing downstream socket");
        }
    }
}

// =============================================================================
// Stream Server
// =============================================================================

/// Shared state for the stream server.
#[derive(Debug)]
struct StreamServerState {
    router: Arc<FanoutRouter>,
    cancel: CancellationToken,
}

#[derive(Debug, Deserialize)]
struct StreamParams {
    #[serde(default)]
    format: WireFormat,
}

/// Downstream WebSocket server.
#[derive(Debug)]
pub struct StreamServer {
    port: u16,
    router: Arc<FanoutRouter>,
    cancel: CancellationToken,
}

impl StreamServer {
    /// Create a new stream server.
    #[must_use]
    pub const fn new(port: u16, router: Arc<FanoutRouter>, cancel: CancellationToken) -> Self {
        Self {
            port,
            router,
            cancel,
        }
    }

    /// The axum application serving `/stream`.
    pub fn app(router: Arc<FanoutRouter>, cancel: CancellationToken) -> Router {
        Router::new()
            .route("/stream", get(stream_handler))
            .with_state(Arc::new(StreamServerState { router, cancel }))
    }

    /// Bind to the configured port and serve until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StreamServerError` if binding fails or the server fails.
    pub async fn run(self) -> Result<(), StreamServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamServerError::BindFailed(self.port, e.to_string()))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `StreamServerError::ServerFailed` if the server fails.
    pub async fn serve(self, listener: TcpListener) -> Result<(), StreamServerError> {
        let local = listener.local_addr().ok();
        tracing::info!(addr = ?local, "Stream server listening");

        let app = Self::app(self.router, self.cancel.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| StreamServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Stream server stopped");
        Ok(())
    }
}

async fn stream_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StreamParams>,
    State(state): State<Arc<StreamServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.format))
}

async fn handle_socket(socket: WebSocket, state: Arc<StreamServerState>, format: WireFormat) {
    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let mut session = state.router.open_session();
    let handle = session.handle();
    let session_id = session.id();

    let delivery = {
        let handle = handle.clone();
        let mut transport = WebSocketTransport::new(Arc::clone(&sender), format);
        tokio::spawn(async move { deliver_session(handle, &mut transport).await })
    };

    tracing::info!(session_id, ?format, "Downstream client connected");

    loop {
        tokio::select! {
            () = handle.closed() => break,
            () = state.cancel.cancelled() => break,
            frame = receiver.next() => {
                let request = match frame {
                    Some(Ok(Message::Text(text))) => ClientRequest::from_json(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => ClientRequest::from_msgpack(&bytes),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(session_id, error = %e, "Downstream read failed");
                        metrics::record_websocket_error(Side::Downstream, "read");
                        break;
                    }
                };

                let reply = match request {
                    Ok(request) => apply_request(&mut session, &request),
                    Err(e) => ServerMessage::error(e.to_string()),
                };

                if let Err(e) = send_reply(&sender, format, &reply).await {
                    tracing::warn!(session_id, error = %e, "Downstream reply failed");
                    metrics::record_websocket_error(Side::Downstream, "write");
                    break;
                }
            }
        }
    }

    session.close();

    match delivery.await {
        Ok(Ok(delivered)) => {
            tracing::info!(session_id, delivered, "Downstream client disconnected");
        }
        Ok(Err(e)) => tracing::info!(session_id, error = %e, "Downstream client dropped"),
        Err(e) => tracing::error!(session_id, error = %e, "Delivery task failed"),
    }
}

/// Apply one interest update and build the reply.
fn apply_request(session: &mut ClientSession, request: &ClientRequest) -> ServerMessage {
    let symbols = match request.normalized_symbols() {
        Ok(symbols) => symbols,
        Err(e) => return ServerMessage::error(e.to_string()),
    };

    let result = match request.action {
        ClientAction::Subscribe => session.subscribe(symbols),
        ClientAction::Unsubscribe => session.unsubscribe(symbols),
    };
    if let Err(e) = result {
        tracing::debug!(session_id = session.id(), error = %e, "Interest update rejected");
        return ServerMessage::error(e.to_string());
    }

    let mut interest: Vec<Symbol> = session.interest().iter().cloned().collect();
    interest.sort();

    match request.action {
        ClientAction::Subscribe => ServerMessage::Subscribed { symbols: interest },
        ClientAction::Unsubscribe => ServerMessage::Unsubscribed { symbols: interest },
    }
}

async fn send_reply<S>(
    sender: &Arc<Mutex<S>>,
    format: WireFormat,
    reply: &ServerMessage,
) -> Result<(), DeliveryError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = format
        .encode(reply)
        .map_err(|e| DeliveryError::Encode(e.to_string()))?;
    sender
        .lock()
        .await
        .send(frame.into())
        .await
        .map_err(|e| DeliveryError::Write(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::{SessionConfig, SessionState};
    use crate::domain::subscription::{SubscriptionRegistry, UpstreamControl};
    use chrono::Utc;
    use futures::channel::mpsc;
    use rust_decimal::Decimal;

    struct NoopUpstream;

    impl UpstreamControl for NoopUpstream {
        fn subscribe(&self, _: &Symbol) {}
        fn unsubscribe(&self, _: &Symbol) {}
    }

    fn router(max_symbols: usize) -> FanoutRouter {
        FanoutRouter::new(
            Arc::new(SubscriptionRegistry::new(Arc::new(NoopUpstream))),
            SessionConfig {
                queue_capacity: 8,
                max_symbols,
            },
        )
    }

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn request(text: &str) -> ClientRequest {
        ClientRequest::from_json(text).unwrap()
    }

    #[test]
    fn subscribe_ack_lists_full_interest() {
        let router = router(10);
        let mut session = router.open_session();

        apply_request(&mut session, &request(r#"{"action":"subscribe","symbols":["msft"]}"#));
        let reply = apply_request(
            &mut session,
            &request(r#"{"action":"subscribe","symbols":["aapl"]}"#),
        );

        assert_eq!(
            reply,
            ServerMessage::Subscribed {
                symbols: vec![sym("AAPL"), sym("MSFT")]
            }
        );
        assert_eq!(router.registry().refcount(&sym("AAPL")), 1);
    }

    #[test]
    fn unsubscribe_ack_lists_remaining_interest() {
        let router = router(10);
        let mut session = router.open_session();

        apply_request(
            &mut session,
            &request(r#"{"action":"subscribe","symbols":["AAPL","MSFT"]}"#),
        );
        let reply = apply_request(
            &mut session,
            &request(r#"{"action":"unsubscribe","symbols":["AAPL","TSLA"]}"#),
        );

        assert_eq!(
            reply,
            ServerMessage::Unsubscribed {
                symbols: vec![sym("MSFT")]
            }
        );
        assert!(!router.registry().is_active(&sym("AAPL")));
    }

    #[test]
    fn over_limit_request_is_rejected_and_interest_kept() {
        let router = router(2);
        let mut session = router.open_session();

        apply_request(&mut session, &request(r#"{"action":"subscribe","symbols":["A"]}"#));
        let reply = apply_request(
            &mut session,
            &request(r#"{"action":"subscribe","symbols":["B","C"]}"#),
        );

        assert!(matches!(reply, ServerMessage::Error { ref message } if message.contains("limit")));
        assert_eq!(session.interest().len(), 1);
        assert_eq!(session.state(), SessionState::Open);
    }

    #[test]
    fn invalid_symbol_is_rejected() {
        let router = router(10);
        let mut session = router.open_session();

        let reply = apply_request(
            &mut session,
            &request(r#"{"action":"subscribe","symbols":["AA PL"]}"#),
        );

        assert!(matches!(reply, ServerMessage::Error { .. }));
        assert!(session.interest().is_empty());
    }

    #[tokio::test]
    async fn transport_writes_encoded_ticks() {
        let (tx, mut rx) = mpsc::channel::<Message>(4);
        let mut transport = WebSocketTransport::new(Arc::new(Mutex::new(tx)), WireFormat::Json);
        let tick = Tick::new(sym("AAPL"), Decimal::new(101, 0), Utc::now());

        transport.deliver(&tick).await.unwrap();

        let Some(Message::Text(text)) = rx.next().await else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["price"], "101");
    }

    #[tokio::test]
    async fn transport_reports_write_failure() {
        let (tx, rx) = mpsc::channel::<Message>(4);
        drop(rx);
        let mut transport = WebSocketTransport::new(Arc::new(Mutex::new(tx)), WireFormat::MsgPack);
        let tick = Tick::new(sym("AAPL"), Decimal::new(101, 0), Utc::now());

        let err = transport.deliver(&tick).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Write(_)));
    }

    #[tokio::test]
    async fn failed_write_closes_session_and_releases_interest() {
        let router = router(10);
        let mut session = router.open_session();
        session.subscribe([sym("AAPL")]).unwrap();

        let (tx, rx) = mpsc::channel::<Message>(1);
        drop(rx);
        let mut transport = WebSocketTransport::new(Arc::new(Mutex::new(tx)), WireFormat::Json);
        let handle = session.handle();
        let delivery = tokio::spawn(async move { deliver_session(handle, &mut transport).await });

        router.dispatch(&Tick::new(sym("AAPL"), Decimal::new(1, 0), Utc::now()));

        let result = delivery.await.unwrap();
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!router.registry().is_active(&sym("AAPL")));
        assert_eq!(router.session_count(), 0);
    }
}
