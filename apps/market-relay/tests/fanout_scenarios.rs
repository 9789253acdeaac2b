//! Fan-out Scenario Tests
//!
//! Exercises the router and sessions in-process: slow consumer isolation,
//! queue pressure, concurrent close and connector event handling.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use market_relay::{
    ConnectionState, DeliveryError, FanoutRouter, FeedEvent, SessionConfig, SessionState,
    SubscriptionRegistry, Symbol, Tick, TickTransport, UpstreamControl, deliver_session,
};

struct NoopUpstream;

impl UpstreamControl for NoopUpstream {
    fn subscribe(&self, _: &Symbol) {}
    fn unsubscribe(&self, _: &Symbol) {}
}

fn router(queue_capacity: usize) -> FanoutRouter {
    FanoutRouter::new(
        Arc::new(SubscriptionRegistry::new(Arc::new(NoopUpstream))),
        SessionConfig {
            queue_capacity,
            max_symbols: 16,
        },
    )
}

fn sym(s: &str) -> Symbol {
    Symbol::new(s).unwrap()
}

fn tick(symbol: &str, cents: i64) -> Tick {
    Tick::new(sym(symbol), Decimal::new(cents, 2), Utc::now())
}

/// Accepts one tick, then never completes another write.
struct StalledTransport {
    entered: Arc<Notify>,
}

#[async_trait]
impl TickTransport for StalledTransport {
    async fn deliver(&mut self, _tick: &Tick) -> Result<(), DeliveryError> {
        self.entered.notify_one();
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn test_stalled_consumer_does_not_hold_back_others() {
    let router = router(4);

    let mut fast = router.open_session();
    let mut slow = router.open_session();
    fast.subscribe([sym("AAPL")]).unwrap();
    slow.subscribe([sym("AAPL")]).unwrap();

    let entered = Arc::new(Notify::new());
    let slow_handle = slow.handle();
    let mut transport = StalledTransport {
        entered: Arc::clone(&entered),
    };
    let _delivery = tokio::spawn(async move { deliver_session(slow_handle, &mut transport).await });

    let fast_ticks = fast.drain();
    futures::pin_mut!(fast_ticks);

    router.dispatch(&tick("AAPL", 1));
    entered.notified().await;
    assert_eq!(fast_ticks.next().await.unwrap().price(), Decimal::new(1, 2));

    let mut coalesced = 0;
    for cents in 2..=50 {
        let report = router.dispatch(&tick("AAPL", cents));
        assert_eq!(report.delivered, 2);
        coalesced += report.coalesced;

        // The fast session sees every tick in order.
        let received = fast_ticks.next().await.unwrap();
        assert_eq!(received.price(), Decimal::new(cents, 2));
    }

    // The stalled session holds only the newest ticks.
    assert_eq!(coalesced, 49 - 4);
    assert_eq!(slow.handle().queued(), 4);
    assert_eq!(slow.state(), SessionState::Open);

    let kept: Vec<Decimal> = slow.drain().take(4).map(|t| t.price()).collect().await;
    let expected: Vec<Decimal> = (47..=50).map(|c| Decimal::new(c, 2)).collect();
    assert_eq!(kept, expected);
}

#[tokio::test]
async fn test_full_queue_coalesces_then_evicts() {
    let router = router(3);
    let mut session = router.open_session();
    session
        .subscribe([sym("AAPL"), sym("MSFT"), sym("SPY"), sym("TSLA")])
        .unwrap();

    router.dispatch(&tick("AAPL", 100));
    router.dispatch(&tick("MSFT", 200));
    router.dispatch(&tick("SPY", 300));

    let report = router.dispatch(&tick("AAPL", 101));
    assert_eq!(report.coalesced, 1);
    assert_eq!(report.evicted, 0);

    let report = router.dispatch(&tick("TSLA", 400));
    assert_eq!(report.coalesced, 0);
    assert_eq!(report.evicted, 1);

    let queued: Vec<(String, Decimal)> = session
        .drain()
        .take(3)
        .map(|t| (t.symbol().to_string(), t.price()))
        .collect()
        .await;
    assert_eq!(
        queued,
        vec![
            ("SPY".to_string(), Decimal::new(300, 2)),
            ("AAPL".to_string(), Decimal::new(101, 2)),
            ("TSLA".to_string(), Decimal::new(400, 2)),
        ]
    );
}

#[test]
fn test_sessions_close_safely_during_dispatch() {
    const SYMBOLS: [&str; 4] = ["AAPL", "MSFT", "SPY", "TSLA"];

    let router = router(8);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for cents in 0..5_000 {
                for symbol in SYMBOLS {
                    router.dispatch(&tick(symbol, cents));
                }
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..4 {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let mut session = router.open_session();
                    session.subscribe(SYMBOLS.map(sym)).unwrap();
                    session.close();
                }
            });
        }
    });

    assert_eq!(router.session_count(), 0);
    assert!(router.registry().active_symbols().is_empty());
    assert_eq!(router.registry().stats().total_interest, 0);
}

#[tokio::test]
async fn test_router_applies_feed_events_and_closes_sessions_at_end() {
    let router = router(8);
    let mut session = router.open_session();
    session.subscribe([sym("AAPL")]).unwrap();
    let handle = session.handle();

    let events = futures::stream::iter(vec![
        FeedEvent::Connected,
        FeedEvent::Resubscribed { symbols: 1 },
        FeedEvent::Tick(tick("AAPL", 18_912)),
        FeedEvent::Tick(tick("MSFT", 41_050)),
        FeedEvent::ProtocolError("unknown message type: zz".to_string()),
    ]);
    router.run(events, CancellationToken::new()).await;

    let snapshot = router.feed_state().snapshot();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.ticks_received, 2);
    assert_eq!(snapshot.protocol_errors, 1);
    assert_eq!(snapshot.upstream_symbols, 1);

    // The event stream ended, so every session was closed.
    assert_eq!(handle.state(), SessionState::Closed);
    assert_eq!(router.session_count(), 0);
    assert!(!router.registry().is_active(&sym("AAPL")));
}
