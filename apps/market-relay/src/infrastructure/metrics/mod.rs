//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ticks**: received from upstream, delivered, coalesced and evicted
//! - **Connections**: upstream connection state and downstream sessions
//! - **Subscriptions**: symbols currently subscribed upstream
//! - **Errors**: protocol errors, reconnects, delivery failures
//! - **Latency**: per-tick dispatch duration
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! functions are no-ops until [`init_metrics`] installs the recorder.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Repeated calls return the handle installed by the first call.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();

    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Tick counters
    describe_counter!(
        "market_relay_ticks_received_total",
        "Total ticks received from the upstream feed"
    );
    describe_counter!(
        "market_relay_ticks_delivered_total",
        "Total ticks queued for downstream sessions"
    );
    describe_counter!(
        "market_relay_ticks_coalesced_total",
        "Queued ticks replaced by a newer tick for the same symbol"
    );
    describe_counter!(
        "market_relay_ticks_evicted_total",
        "Queued ticks evicted from a full session queue"
    );

    // Connection gauges
    describe_gauge!(
        "market_relay_upstream_connected",
        "1 while the upstream feed is connected and authenticated"
    );
    describe_gauge!(
        "market_relay_sessions",
        "Number of open downstream sessions"
    );

    // Subscription gauges
    describe_gauge!(
        "market_relay_upstream_symbols",
        "Symbols currently subscribed upstream"
    );

    // Error counters
    describe_counter!(
        "market_relay_protocol_errors_total",
        "Malformed upstream messages dropped"
    );
    describe_counter!(
        "market_relay_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "market_relay_upstream_unavailable_total",
        "Times the upstream feed was declared unavailable"
    );
    describe_counter!(
        "market_relay_websocket_errors_total",
        "Total WebSocket errors by side and type"
    );
    describe_counter!(
        "market_relay_delivery_failures_total",
        "Sessions closed after a failed downstream write"
    );

    // Latency histograms
    describe_histogram!(
        "market_relay_dispatch_seconds",
        "Time to fan one tick out to all interested sessions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Which side of the relay a WebSocket error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The upstream feed connection.
    Upstream,
    /// A downstream session.
    Downstream,
}

impl Side {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        }
    }
}

/// Record a tick received from upstream.
pub fn record_tick_received() {
    counter!("market_relay_ticks_received_total").increment(1);
}

/// Record the outcome of dispatching one tick.
pub fn record_dispatch(delivered: usize, coalesced: usize, evicted: usize, duration: Duration) {
    counter!("market_relay_ticks_delivered_total").increment(delivered as u64);
    if coalesced > 0 {
        counter!("market_relay_ticks_coalesced_total").increment(coalesced as u64);
    }
    if evicted > 0 {
        counter!("market_relay_ticks_evicted_total").increment(evicted as u64);
    }
    histogram!("market_relay_dispatch_seconds").record(duration.as_secs_f64());
}

/// Update the upstream connection gauge.
pub fn set_upstream_connected(connected: bool) {
    gauge!("market_relay_upstream_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Update the open session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions(count: usize) {
    gauge!("market_relay_sessions").set(count as f64);
}

/// Update the upstream symbol count.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_symbols(count: usize) {
    gauge!("market_relay_upstream_symbols").set(count as f64);
}

/// Record a dropped malformed upstream message.
pub fn record_protocol_error() {
    counter!("market_relay_protocol_errors_total").increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!("market_relay_reconnects_total").increment(1);
}

/// Record the upstream being declared unavailable.
pub fn record_upstream_unavailable() {
    counter!("market_relay_upstream_unavailable_total").increment(1);
    set_upstream_connected(false);
}

/// Record a WebSocket error.
pub fn record_websocket_error(side: Side, error_type: &str) {
    counter!(
        "market_relay_websocket_errors_total",
        "side" => side.as_str(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a session closed after a failed write.
pub fn record_delivery_failure() {
    counter!("market_relay_delivery_failures_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
