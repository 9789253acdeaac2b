//! Client Sessions
//!
//! One [`ClientSession`] per downstream consumer. A session owns its symbol
//! interest set and a bounded outbound queue.
//!
//! # Tasks
//!
//! A session is driven by two tasks:
//! - the inbound task owns the [`ClientSession`] and applies interest updates
//! - the outbound task holds a [`SessionHandle`] and runs [`deliver_session`],
//!   draining the queue into a [`TickTransport`]
//!
//! # Lifecycle
//!
//! `Open → Closing → Closed`. Closing releases all registry interest in one
//! critical section, detaches the session from the router and ends the
//! drain. `enqueue` and `update_interest` are no-ops once closing.
//!
//! # Backpressure
//!
//! The queue coalesces on full: the oldest queued tick for the incoming
//! tick's symbol is dropped and the new one appended. If no tick for that
//! symbol is queued, the oldest tick overall is evicted. Per-symbol order
//! is preserved either way and the newest value is always retained.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{DeliveryError, EnqueueOutcome, TickSink, TickTransport};
use crate::domain::streaming::{Symbol, Tick};
use crate::domain::subscription::{SessionId, SubscriptionRegistry};
use crate::infrastructure::metrics;

use super::router::SessionDirectory;

// =============================================================================
// Configuration
// =============================================================================

/// Default outbound queue capacity per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default maximum number of symbols one session may hold.
pub const DEFAULT_MAX_SYMBOLS: usize = 500;

/// Per-session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Outbound queue capacity (minimum 1).
    pub queue_capacity: usize,
    /// Maximum symbols in one interest set.
    pub max_symbols: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_symbols: DEFAULT_MAX_SYMBOLS,
        }
    }
}

// =============================================================================
// Errors and Results
// =============================================================================

/// Session-level failures. None of these affect other sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The requested interest set is larger than allowed.
    #[error("interest of {requested} symbols exceeds the limit of {limit}")]
    TooManySymbols {
        /// Size of the rejected interest set.
        requested: usize,
        /// Configured limit.
        limit: usize,
    },

    /// The downstream transport rejected a write; the session was closed.
    #[error("session delivery failed: {0}")]
    DeliveryFailed(#[from] DeliveryError),
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting ticks and interest updates.
    Open,
    /// Close in progress; everything is a no-op.
    Closing,
    /// Terminal.
    Closed,
}

/// Symbols added and removed by an interest update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterestDelta {
    /// Newly added symbols, sorted.
    pub added: Vec<Symbol>,
    /// Dropped symbols, sorted.
    pub removed: Vec<Symbol>,
}

impl InterestDelta {
    /// Whether the update changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

// =============================================================================
// Session Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueInner {
    ticks: VecDeque<Tick>,
    closed: bool,
}

/// Bounded, coalescing tick queue with a single async consumer.
#[derive(Debug)]
pub struct SessionQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl SessionQueue {
    /// Create a queue holding at most `capacity` ticks (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    /// Append a tick without blocking, coalescing when full.
    pub fn push(&self, tick: Tick) -> EnqueueOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return EnqueueOutcome::Closed;
            }

            let outcome = if inner.ticks.len() < self.capacity {
                EnqueueOutcome::Queued
            } else if let Some(pos) = inner
                .ticks
                .iter()
                .position(|queued| queued.symbol() == tick.symbol())
            {
                inner.ticks.remove(pos);
                EnqueueOutcome::Coalesced
            } else {
                inner.ticks.pop_front();
                EnqueueOutcome::Evicted
            };

            inner.ticks.push_back(tick);
            outcome
        };

        self.notify.notify_one();
        outcome
    }

    /// Wait for the next tick. Returns `None` once the queue is closed.
    pub async fn pop(&self) -> Option<Tick> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if let Some(tick) = inner.ticks.pop_front() {
                    return Some(tick);
                }
            }
            notified.await;
        }
    }

    /// Close the queue, discarding anything still queued.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
            inner.ticks.clear();
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
        true
    }

    /// Number of queued ticks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().ticks.len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ticks.is_empty()
    }

    /// Maximum number of queued ticks.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

// =============================================================================
// Session Core
// =============================================================================

/// State shared by a session's inbound task, outbound task and the router.
#[derive(Debug)]
pub(crate) struct SessionCore {
    id: SessionId,
    state: Mutex<SessionState>,
    queue: SessionQueue,
    registry: Arc<SubscriptionRegistry>,
    directory: Arc<SessionDirectory>,
    closed: CancellationToken,
}

impl SessionCore {
    pub(crate) fn new(
        id: SessionId,
        queue_capacity: usize,
        registry: Arc<SubscriptionRegistry>,
        directory: Arc<SessionDirectory>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState::Open),
            queue: SessionQueue::new(queue_capacity),
            registry,
            directory,
            closed: CancellationToken::new(),
        }
    }

    fn state(&self) -> SessionState {
        *self.state.lock()
    }

    fn shutdown(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != SessionState::Open {
                return false;
            }
            *state = SessionState::Closing;
        }

        self.queue.close();
        self.directory.remove(self.id, self);
        let released = self.registry.remove_session(self.id);

        *self.state.lock() = SessionState::Closed;
        self.closed.cancel();
        metrics::set_sessions(self.directory.len());

        tracing::info!(
            session_id = self.id,
            released = released.len(),
            "Session closed"
        );
        true
    }
}

impl TickSink for SessionCore {
    fn enqueue(&self, tick: Tick) -> EnqueueOutcome {
        self.queue.push(tick)
    }

    fn close(&self) {
        self.shutdown();
    }
}

fn drain_queue(core: Arc<SessionCore>) -> impl Stream<Item = Tick> + Send + 'static {
    futures::stream::unfold(core, |core| async move {
        let tick = core.queue.pop().await?;
        Some((tick, core))
    })
}

// =============================================================================
// Client Session
// =============================================================================

/// A downstream consumer, owned by its inbound transport task.
///
/// Dropping the session closes it.
#[derive(Debug)]
pub struct ClientSession {
    core: Arc<SessionCore>,
    interest: HashSet<Symbol>,
    max_symbols: usize,
}

impl ClientSession {
    pub(crate) fn new(core: Arc<SessionCore>, max_symbols: usize) -> Self {
        Self {
            core,
            interest: HashSet::new(),
            max_symbols,
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.core.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Current interest set.
    #[must_use]
    pub const fn interest(&self) -> &HashSet<Symbol> {
        &self.interest
    }

    /// Replace the interest set, applying only the difference to the registry.
    ///
    /// A no-op returning an empty delta once the session is closing.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TooManySymbols`] if `symbols` exceeds the
    /// per-session limit; the interest set is left unchanged.
    pub fn update_interest(
        &mut self,
        symbols: HashSet<Symbol>,
    ) -> Result<InterestDelta, SessionError> {
        if symbols.len() > self.max_symbols {
            return Err(SessionError::TooManySymbols {
                requested: symbols.len(),
                limit: self.max_symbols,
            });
        }

        // Held across the registry calls so a concurrent close either runs
        // entirely before this update or observes all of it.
        let state = self.core.state.lock();
        if *state != SessionState::Open {
            tracing::trace!(session_id = self.core.id, "Interest update on closing session ignored");
            return Ok(InterestDelta::default());
        }

        let mut added: Vec<Symbol> = symbols.difference(&self.interest).cloned().collect();
        let mut removed: Vec<Symbol> = self.interest.difference(&symbols).cloned().collect();
        added.sort();
        removed.sort();

        for symbol in &removed {
            self.core.registry.remove_interest(self.core.id, symbol);
        }
        for symbol in &added {
            self.core.registry.add_interest(self.core.id, symbol);
        }
        drop(state);

        self.interest = symbols;

        if !added.is_empty() || !removed.is_empty() {
            tracing::debug!(
                session_id = self.core.id,
                added = added.len(),
                removed = removed.len(),
                total = self.interest.len(),
                "Session interest updated"
            );
        }

        Ok(InterestDelta { added, removed })
    }

    /// Add symbols to the interest set.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::TooManySymbols`] if the resulting set is too large.
    pub fn subscribe<I>(&mut self, symbols: I) -> Result<InterestDelta, SessionError>
    where
        I: IntoIterator<Item = Symbol>,
    {
        let mut next = self.interest.clone();
        next.extend(symbols);
        self.update_interest(next)
    }

    /// Remove symbols from the interest set.
    ///
    /// # Errors
    ///
    /// Never fails in practice (the set only shrinks); shares the
    /// [`update_interest`](Self::update_interest) signature.
    pub fn unsubscribe<I>(&mut self, symbols: I) -> Result<InterestDelta, SessionError>
    where
        I: IntoIterator<Item = Symbol>,
    {
        let mut next = self.interest.clone();
        for symbol in symbols {
            next.remove(&symbol);
        }
        self.update_interest(next)
    }

    /// Offer a tick directly to this session's queue. Never blocks.
    pub fn enqueue(&self, tick: Tick) -> EnqueueOutcome {
        self.core.enqueue(tick)
    }

    /// Lazy sequence of queued ticks; ends when the session closes.
    pub fn drain(&self) -> impl Stream<Item = Tick> + Send + 'static {
        drain_queue(Arc::clone(&self.core))
    }

    /// Cloneable handle for the outbound task.
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Close the session, releasing all interest. Idempotent.
    ///
    /// Returns `true` on the call that performed the close.
    pub fn close(&mut self) -> bool {
        let closed = self.core.shutdown();
        self.interest.clear();
        closed
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

// =============================================================================
// Session Handle
// =============================================================================

/// Shared handle to a session, used by the outbound delivery task.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    core: Arc<SessionCore>,
}

impl SessionHandle {
    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.core.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Lazy sequence of queued ticks; ends when the session closes.
    pub fn drain(&self) -> impl Stream<Item = Tick> + Send + 'static {
        drain_queue(Arc::clone(&self.core))
    }

    /// Close the session. Idempotent.
    pub fn close(&self) -> bool {
        self.core.shutdown()
    }

    /// Resolves once the session has closed.
    pub async fn closed(&self) {
        self.core.closed.cancelled().await;
    }

    /// Ticks currently queued.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.core.queue.len()
    }
}

// =============================================================================
// Delivery Loop
// =============================================================================

/// Drain a session into its transport until the session closes.
///
/// A failed write closes the session (releasing its interest) and is
/// reported as [`SessionError::DeliveryFailed`]. Returns the number of
/// ticks delivered otherwise.
///
/// # Errors
///
/// Returns [`SessionError::DeliveryFailed`] when the transport rejects a write.
pub async fn deliver_session<T>(handle: SessionHandle, transport: &mut T) -> Result<u64, SessionError>
where
    T: TickTransport + ?Sized,
{
    let drain = handle.drain();
    futures::pin_mut!(drain);

    let mut delivered = 0u64;
    while let Some(tick) = drain.next().await {
        if let Err(e) = transport.deliver(&tick).await {
            tracing::warn!(
                session_id = handle.id(),
                symbol = %tick.symbol(),
                error = %e,
                "Delivery failed, closing session"
            );
            metrics::record_delivery_failure();
            handle.close();
            transport.close().await;
            return Err(SessionError::DeliveryFailed(e));
        }
        delivered += 1;
    }

    transport.close().await;
    tracing::debug!(session_id = handle.id(), delivered, "Delivery loop finished");
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::router::FanoutRouter;
    use crate::domain::subscription::UpstreamControl;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq};

    struct NoopUpstream;

    impl UpstreamControl for NoopUpstream {
        fn subscribe(&self, _: &Symbol) {}
        fn unsubscribe(&self, _: &Symbol) {}
    }

    fn sym(s: &str) -> Symbol {
        Symbol::new(s).unwrap()
    }

    fn tick(symbol: &str, cents: i64) -> Tick {
        Tick::new(sym(symbol), Decimal::new(cents, 2), Utc::now())
    }

    fn symbols(raw: &[&str]) -> HashSet<Symbol> {
        raw.iter().map(|s| sym(s)).collect()
    }

    fn router(config: SessionConfig) -> FanoutRouter {
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(NoopUpstream)));
        FanoutRouter::new(registry, config)
    }

    #[test]
    fn queue_push_pop_in_order() {
        let queue = SessionQueue::new(4);
        assert_eq!(queue.push(tick("AAPL", 100)), EnqueueOutcome::Queued);
        assert_eq!(queue.push(tick("AAPL", 101)), EnqueueOutcome::Queued);

        let mut first = tokio_test::task::spawn(queue.pop());
        let popped = assert_ready!(first.poll()).unwrap();
        assert_eq!(popped.price(), Decimal::new(100, 2));
        drop(first);

        let mut second = tokio_test::task::spawn(queue.pop());
        let popped = assert_ready!(second.poll()).unwrap();
        assert_eq!(popped.price(), Decimal::new(101, 2));
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_pop_waits_for_push() {
        let queue = SessionQueue::new(4);
        let mut pop = tokio_test::task::spawn(queue.pop());

        assert_pending!(pop.poll());
        queue.push(tick("AAPL", 100));
        assert!(pop.is_woken());

        let popped = assert_ready!(pop.poll()).unwrap();
        assert_eq!(popped.price(), Decimal::new(100, 2));
    }

    #[test]
    fn queue_close_wakes_pending_pop() {
        let queue = SessionQueue::new(4);
        let mut pop = tokio_test::task::spawn(queue.pop());

        assert_pending!(pop.poll());
        assert!(queue.close());
        assert!(pop.is_woken());
        assert_ready_eq!(pop.poll(), None);
    }

    #[test]
    fn queue_close_is_idempotent_and_rejects_pushes() {
        let queue = SessionQueue::new(4);
        queue.push(tick("AAPL", 100));

        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_empty());
        assert_eq!(queue.push(tick("AAPL", 101)), EnqueueOutcome::Closed);
    }

    #[test]
    fn queue_full_coalesces_same_symbol() {
        let queue = SessionQueue::new(3);
        queue.push(tick("AAPL", 100));
        queue.push(tick("MSFT", 200));
        queue.push(tick("AAPL", 101));

        assert_eq!(queue.push(tick("AAPL", 102)), EnqueueOutcome::Coalesced);
        assert_eq!(queue.len(), 3);

        let prices: Vec<(String, Decimal)> = {
            let inner = queue.inner.lock();
            inner
                .ticks
                .iter()
                .map(|t| (t.symbol().to_string(), t.price()))
                .collect()
        };
        assert_eq!(
            prices,
            vec![
                ("MSFT".to_string(), Decimal::new(200, 2)),
                ("AAPL".to_string(), Decimal::new(101, 2)),
                ("AAPL".to_string(), Decimal::new(102, 2)),
            ]
        );
    }

    #[test]
    fn queue_full_without_symbol_evicts_oldest() {
        let queue = SessionQueue::new(2);
        queue.push(tick("AAPL", 100));
        queue.push(tick("MSFT", 200));

        assert_eq!(queue.push(tick("TSLA", 300)), EnqueueOutcome::Evicted);
        assert_eq!(queue.len(), 2);

        let symbols: Vec<String> = queue
            .inner
            .lock()
            .ticks
            .iter()
            .map(|t| t.symbol().to_string())
            .collect();
        assert_eq!(symbols, vec!["MSFT".to_string(), "TSLA".to_string()]);
    }

    #[test]
    fn queue_zero_capacity_holds_one() {
        let queue = SessionQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.push(tick("AAPL", 100));
        assert_eq!(queue.push(tick("AAPL", 101)), EnqueueOutcome::Coalesced);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn coalescing_keeps_newest_values_per_symbol_in_order() {
        let queue = SessionQueue::new(4);
        let mut coalesced = 0;
        for cents in 0..100 {
            for t in [tick("AAPL", cents), tick("MSFT", 1000 + cents)] {
                if queue.push(t) == EnqueueOutcome::Coalesced {
                    coalesced += 1;
                }
            }
        }

        let mut aapl = Vec::new();
        let mut msft = Vec::new();
        for t in queue.inner.lock().ticks.drain(..) {
            match t.symbol().as_str() {
                "AAPL" => aapl.push(t.price()),
                _ => msft.push(t.price()),
            }
        }

        assert_eq!(aapl, vec![Decimal::new(98, 2), Decimal::new(99, 2)]);
        assert_eq!(msft, vec![Decimal::new(1098, 2), Decimal::new(1099, 2)]);
        assert_eq!(coalesced, 196);
    }

    #[test]
    fn update_interest_applies_diff_to_registry() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();
        let registry = Arc::clone(router.registry());

        let delta = session
            .update_interest(symbols(&["AAPL", "MSFT"]))
            .unwrap();
        assert_eq!(delta.added, vec![sym("AAPL"), sym("MSFT")]);
        assert!(delta.removed.is_empty());

        let delta = session
            .update_interest(symbols(&["MSFT", "TSLA"]))
            .unwrap();
        assert_eq!(delta.added, vec![sym("TSLA")]);
        assert_eq!(delta.removed, vec![sym("AAPL")]);

        assert_eq!(
            registry.session_symbols(session.id()),
            vec![sym("MSFT"), sym("TSLA")]
        );
        assert!(!registry.is_active(&sym("AAPL")));
    }

    #[test]
    fn subscribe_and_unsubscribe_adjust_interest() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();

        session.subscribe([sym("AAPL")]).unwrap();
        session.subscribe([sym("MSFT"), sym("AAPL")]).unwrap();
        assert_eq!(session.interest(), &symbols(&["AAPL", "MSFT"]));

        let delta = session.unsubscribe([sym("AAPL"), sym("NVDA")]).unwrap();
        assert_eq!(delta.removed, vec![sym("AAPL")]);
        assert_eq!(session.interest(), &symbols(&["MSFT"]));
    }

    #[test]
    fn update_interest_rejects_too_many_symbols() {
        let router = router(SessionConfig {
            queue_capacity: 8,
            max_symbols: 2,
        });
        let mut session = router.open_session();

        let err = session
            .update_interest(symbols(&["AAPL", "MSFT", "TSLA"]))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::TooManySymbols {
                requested: 3,
                limit: 2
            }
        ));
        assert!(session.interest().is_empty());
        assert!(router.registry().active_symbols().is_empty());
    }

    #[test]
    fn close_releases_interest_and_is_idempotent() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();
        let id = session.id();
        session.subscribe([sym("AAPL")]).unwrap();

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(router.registry().interested_sessions(&sym("AAPL")).is_empty());
        assert!(router.registry().session_symbols(id).is_empty());
        assert_eq!(router.session_count(), 0);
    }

    #[test]
    fn operations_after_close_are_noops() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();
        let handle = session.handle();

        handle.close();

        assert_eq!(session.enqueue(tick("AAPL", 100)), EnqueueOutcome::Closed);
        let delta = session.update_interest(symbols(&["AAPL"])).unwrap();
        assert!(delta.is_empty());
        assert!(!router.registry().is_active(&sym("AAPL")));
    }

    #[test]
    fn drop_closes_session() {
        let router = router(SessionConfig::default());
        {
            let mut session = router.open_session();
            session.subscribe([sym("AAPL")]).unwrap();
            assert_eq!(router.session_count(), 1);
        }
        assert_eq!(router.session_count(), 0);
        assert!(!router.registry().is_active(&sym("AAPL")));
    }

    #[tokio::test]
    async fn drain_yields_ticks_then_ends_on_close() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();
        let drain = session.drain();
        futures::pin_mut!(drain);

        session.enqueue(tick("AAPL", 100));
        session.enqueue(tick("AAPL", 101));

        assert_eq!(drain.next().await.unwrap().price(), Decimal::new(100, 2));
        assert_eq!(drain.next().await.unwrap().price(), Decimal::new(101, 2));

        session.close();
        let end = tokio::time::timeout(Duration::from_secs(1), drain.next())
            .await
            .unwrap();
        assert!(end.is_none());
    }

    #[derive(Default)]
    struct RecordingTransport {
        delivered: Vec<Tick>,
        fail_after: Option<usize>,
        closed: bool,
    }

    #[async_trait]
    impl TickTransport for RecordingTransport {
        async fn deliver(&mut self, tick: &Tick) -> Result<(), DeliveryError> {
            if self.fail_after.is_some_and(|n| self.delivered.len() >= n) {
                return Err(DeliveryError::Closed);
            }
            self.delivered.push(tick.clone());
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    #[tokio::test]
    async fn deliver_session_runs_until_close() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();
        let handle = session.handle();

        session.enqueue(tick("AAPL", 100));
        session.enqueue(tick("MSFT", 200));

        let task = tokio::spawn(async move {
            let mut transport = RecordingTransport::default();
            let result = deliver_session(handle, &mut transport).await;
            (result, transport)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.close();

        let (result, transport) = task.await.unwrap();
        assert_eq!(result.unwrap(), 2);
        assert_eq!(transport.delivered.len(), 2);
        assert!(transport.closed);
    }

    #[tokio::test]
    async fn delivery_failure_closes_session_and_releases_interest() {
        let router = router(SessionConfig::default());
        let mut session = router.open_session();
        session.subscribe([sym("AAPL")]).unwrap();
        let handle = session.handle();

        session.enqueue(tick("AAPL", 100));
        session.enqueue(tick("AAPL", 101));

        let mut transport = RecordingTransport {
            fail_after: Some(1),
            ..RecordingTransport::default()
        };
        let result = deliver_session(handle.clone(), &mut transport).await;

        assert!(matches!(result, Err(SessionError::DeliveryFailed(_))));
        assert_eq!(transport.delivered.len(), 1);
        assert!(transport.closed);
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(router.registry().interested_sessions(&sym("AAPL")).is_empty());

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
    }
}
