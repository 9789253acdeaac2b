//! Fan-out Router
//!
//! Consumes the upstream [`FeedEvent`] sequence and delivers every tick to
//! each session interested in its symbol. Delivery goes through the
//! non-blocking [`TickSink`] capability, so a stalled session never slows
//! the others or backs up the connector.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{EnqueueOutcome, FeedEvent, TickSink};
use crate::domain::streaming::Tick;
use crate::domain::subscription::{SessionId, SubscriptionRegistry};
use crate::infrastructure::metrics;

use super::feed_state::{ConnectionState, FeedState};
use super::session::{ClientSession, SessionConfig, SessionCore};

// =============================================================================
// Session Directory
// =============================================================================

/// Live sessions by id.
#[derive(Default)]
pub struct SessionDirectory {
    sinks: RwLock<HashMap<SessionId, Arc<dyn TickSink>>>,
}

impl std::fmt::Debug for SessionDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDirectory")
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionDirectory {
    /// Register a sink under an unused id. Returns `false`, leaving the
    /// directory untouched, if `id` is taken.
    pub fn insert_vacant(&self, id: SessionId, sink: Arc<dyn TickSink>) -> bool {
        match self.sinks.write().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(sink);
                true
            }
        }
    }

    /// Unregister `id`, but only while it still maps to `sink`.
    pub fn remove(&self, id: SessionId, sink: &dyn TickSink) -> Option<Arc<dyn TickSink>> {
        let mut sinks = self.sinks.write();
        let owned = sinks.get(&id).is_some_and(|current| {
            std::ptr::addr_eq(Arc::as_ptr(current), std::ptr::from_ref(sink))
        });
        if owned { sinks.remove(&id) } else { None }
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    fn lookup(&self, ids: &[SessionId]) -> Vec<Arc<dyn TickSink>> {
        let sinks = self.sinks.read();
        ids.iter().filter_map(|id| sinks.get(id).cloned()).collect()
    }

    fn take_all(&self) -> Vec<Arc<dyn TickSink>> {
        self.sinks.write().drain().map(|(_, sink)| sink).collect()
    }
}

// =============================================================================
// Dispatch Report
// =============================================================================

/// Per-tick delivery summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Sessions the tick was queued for (including coalesced and evicted).
    pub delivered: usize,
    /// Sessions where a same-symbol tick was coalesced away.
    pub coalesced: usize,
    /// Sessions where another symbol's oldest tick was evicted.
    pub evicted: usize,
    /// Interested sessions that were closing or already gone.
    pub skipped: usize,
}

// =============================================================================
// Fan-out Router
// =============================================================================

/// Routes upstream ticks to interested sessions.
#[derive(Debug)]
pub struct FanoutRouter {
    registry: Arc<SubscriptionRegistry>,
    directory: Arc<SessionDirectory>,
    feed_state: Arc<FeedState>,
    session_config: SessionConfig,
}

impl FanoutRouter {
    /// Create a router over a registry.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, session_config: SessionConfig) -> Self {
        Self {
            registry,
            directory: Arc::new(SessionDirectory::default()),
            feed_state: Arc::new(FeedState::new()),
            session_config,
        }
    }

    /// The registry this router reads interest from.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Upstream status as reported by the connector.
    #[must_use]
    pub const fn feed_state(&self) -> &Arc<FeedState> {
        &self.feed_state
    }

    /// Per-session limits applied to new sessions.
    #[must_use]
    pub const fn session_config(&self) -> SessionConfig {
        self.session_config
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.directory.len()
    }

    /// Open a new session and register it for delivery.
    #[must_use]
    pub fn open_session(&self) -> ClientSession {
        let (id, core) = loop {
            let id = Uuid::new_v4().as_u64_pair().0;
            let core = Arc::new(SessionCore::new(
                id,
                self.session_config.queue_capacity,
                Arc::clone(&self.registry),
                Arc::clone(&self.directory),
            ));
            if self
                .directory
                .insert_vacant(id, Arc::clone(&core) as Arc<dyn TickSink>)
            {
                break (id, core);
            }
        };

        let count = self.directory.len();
        metrics::set_sessions(count);
        tracing::info!(session_id = id, sessions = count, "Session opened");

        ClientSession::new(core, self.session_config.max_symbols)
    }

    /// Deliver one tick to every interested session. Never blocks on a session.
    pub fn dispatch(&self, tick: &Tick) -> DispatchReport {
        let started = Instant::now();
        let interested = self.registry.interested_sessions(tick.symbol());
        let mut report = DispatchReport {
            skipped: interested.len(),
            ..DispatchReport::default()
        };

        if interested.is_empty() {
            return report;
        }

        // Sinks are collected first so no directory lock is held while a
        // sink runs.
        for sink in self.directory.lookup(&interested) {
            match sink.enqueue(tick.clone()) {
                EnqueueOutcome::Queued => report.delivered += 1,
                EnqueueOutcome::Coalesced => {
                    report.delivered += 1;
                    report.coalesced += 1;
                }
                EnqueueOutcome::Evicted => {
                    report.delivered += 1;
                    report.evicted += 1;
                }
                EnqueueOutcome::Closed => continue,
            }
            report.skipped -= 1;
        }

        metrics::record_dispatch(
            report.delivered,
            report.coalesced,
            report.evicted,
            started.elapsed(),
        );
        tracing::trace!(
            symbol = %tick.symbol(),
            delivered = report.delivered,
            coalesced = report.coalesced,
            evicted = report.evicted,
            skipped = report.skipped,
            "Tick dispatched"
        );
        report
    }

    /// Apply one connector event.
    pub fn handle_event(&self, event: FeedEvent) {
        match event {
            FeedEvent::Tick(tick) => {
                self.feed_state.increment_ticks();
                metrics::record_tick_received();
                self.dispatch(&tick);
            }
            FeedEvent::Connected => {
                self.feed_state.set_state(ConnectionState::Connected);
                metrics::set_upstream_connected(true);
                tracing::info!("Upstream feed connected");
            }
            FeedEvent::Disconnected { reason } => {
                self.feed_state.set_state(ConnectionState::Disconnected);
                self.feed_state.set_error(reason.clone());
                metrics::set_upstream_connected(false);
                tracing::warn!(reason = %reason, "Upstream feed disconnected");
            }
            FeedEvent::Reconnecting { attempt, delay } => {
                self.feed_state.record_reconnect_attempt(attempt);
                metrics::record_reconnect_attempt();
                tracing::info!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Upstream feed reconnecting"
                );
            }
            FeedEvent::Unavailable { attempts } => {
                self.feed_state.set_unavailable(attempts);
                metrics::record_upstream_unavailable();
                tracing::error!(attempts, "Upstream feed unavailable, continuing degraded");
            }
            FeedEvent::Resubscribed { symbols } => {
                self.feed_state.set_subscription_count(symbols);
                metrics::set_upstream_symbols(symbols);
                tracing::info!(symbols, "Upstream interest resynchronized");
            }
            FeedEvent::Subscribed { symbols } => {
                self.feed_state.set_subscription_count(symbols.len());
                metrics::set_upstream_symbols(symbols.len());
                tracing::debug!(symbols = symbols.len(), "Upstream subscription confirmed");
            }
            FeedEvent::ProtocolError(message) => {
                tracing::warn!(error = %message, "Dropped malformed upstream message");
                self.feed_state.record_protocol_error(message);
                metrics::record_protocol_error();
            }
        }
    }

    /// Consume connector events until the stream ends or `cancel` fires,
    /// then close every session.
    pub async fn run<S>(&self, events: S, cancel: CancellationToken)
    where
        S: Stream<Item = FeedEvent> + Send,
    {
        futures::pin_mut!(events);
        tracing::info!("Fan-out router started");

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::info!("Fan-out router cancelled");
                    break;
                }
                event = events.next() => {
                    let Some(event) = event else {
                        tracing::warn!("Upstream event stream ended");
                        break;
                    };
                    self.handle_event(event);
                }
            }
        }

        self.close_all();
    }

    /// Close every registered session.
    pub fn close_all(&self) {
        let sinks = self.directory.take_all();
        let count = sinks.len();
        for sink in sinks {
            sink.close();
        }
        metrics::set_sessions(self.directory.len());
        if count > 0 {
            tracing::info!(sessions = count, "Closed all sessions");
        }
    }
}
