//! Port Interfaces
//!
//! Defines the interfaces (ports) between the relay core and the systems
//! around it, following the Hexagonal Architecture pattern. These are the
//! contracts that infrastructure adapters implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`UpstreamControl`]: subscribe/unsubscribe commands towards the upstream feed
//! - [`TickSink`]: non-blocking per-session delivery used by the fan-out router
//! - [`TickTransport`]: the downstream wire a session drains into
//!
//! ## Driver Ports (Inbound)
//!
//! - [`FeedEvent`]: the event sequence produced by the upstream connector
//!   and consumed by the fan-out router

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::streaming::Tick;

pub use crate::domain::subscription::UpstreamControl;

// =============================================================================
// Feed Events
// =============================================================================

/// Events emitted by the upstream connector.
///
/// Ticks arrive in upstream order; the remaining variants describe the
/// connection lifecycle so the router can keep feed status current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Authenticated and resynchronized; ticks will follow.
    Connected,
    /// The live connection was lost.
    Disconnected {
        /// Human readable cause.
        reason: String,
    },
    /// Waiting before the next connection attempt.
    Reconnecting {
        /// Consecutive failed attempts so far.
        attempt: u32,
        /// Backoff delay before the next attempt.
        delay: Duration,
    },
    /// Retries exhausted; the connector is degraded but keeps probing.
    Unavailable {
        /// Consecutive failed attempts.
        attempts: u32,
    },
    /// Interest was replayed upstream after a (re)connect.
    Resubscribed {
        /// Number of symbols re-subscribed.
        symbols: usize,
    },
    /// Upstream confirmed its current subscription set.
    Subscribed {
        /// Symbols the upstream reports as subscribed.
        symbols: Vec<String>,
    },
    /// A malformed upstream message was dropped.
    ProtocolError(String),
    /// A price update.
    Tick(Tick),
}

// =============================================================================
// Tick Sink
// =============================================================================

/// Result of offering a tick to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended with spare capacity.
    Queued,
    /// Queue was full; the oldest queued tick for the same symbol was dropped.
    Coalesced,
    /// Queue was full with no tick for this symbol; the oldest tick overall was dropped.
    Evicted,
    /// The sink is closing or closed; the tick was discarded.
    Closed,
}

/// Capability the fan-out router needs from a session: accept a tick
/// without blocking, and be told to close.
#[cfg_attr(test, mockall::automock)]
pub trait TickSink: Send + Sync {
    /// Offer a tick. Must never block.
    fn enqueue(&self, tick: Tick) -> EnqueueOutcome;

    /// Signal the sink to stop accepting ticks. Once closed, `enqueue`
    /// reports [`EnqueueOutcome::Closed`].
    fn close(&self);
}

// =============================================================================
// Tick Transport
// =============================================================================

/// Failure writing to a downstream transport.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The peer has gone away.
    #[error("transport closed")]
    Closed,

    /// The tick could not be serialized for this transport.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The write itself failed.
    #[error("write failed: {0}")]
    Write(String),
}

/// Downstream wire a session's queue is drained into.
///
/// Implementations own transport-specific framing and serialization.
#[async_trait]
pub trait TickTransport: Send {
    /// Write one tick to the peer.
    async fn deliver(&mut self, tick: &Tick) -> Result<(), DeliveryError>;

    /// Close the transport. Errors are swallowed.
    async fn close(&mut self);
}
