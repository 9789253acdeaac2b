//! Upstream feed status tracking, shared between the router (writer) and
//! the health endpoint (reader).

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Upstream connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected and not yet trying.
    #[default]
    Disconnected,
    /// Connected, authenticated and resynchronized.
    Connected,
    /// Backing off between connection attempts.
    Reconnecting,
    /// Retries exhausted; degraded until the next successful connect.
    Unavailable,
}

impl ConnectionState {
    /// Lowercase label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Unavailable => "unavailable",
        }
    }
}

/// Serializable view of [`FeedState`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    /// Connection state.
    pub state: ConnectionState,
    /// Whether the feed is connected.
    pub connected: bool,
    /// Last successful connect time.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last reported error.
    pub last_error: Option<String>,
    /// Consecutive reconnect attempts (0 while connected).
    pub reconnect_attempts: u32,
    /// Ticks received since start.
    pub ticks_received: u64,
    /// Malformed upstream messages dropped since start.
    pub protocol_errors: u64,
    /// Symbols currently subscribed upstream.
    pub upstream_symbols: usize,
}

/// Connection state for the upstream feed.
#[derive(Debug, Default)]
pub struct FeedState {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    error_message: RwLock<Option<String>>,
    subscription_count: AtomicUsize,
    reconnect_attempts: AtomicU32,
    ticks_received: AtomicU64,
    protocol_errors: AtomicU64,
}

impl FeedState {
    /// Create a disconnected feed state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            self.reconnect_attempts.store(0, Ordering::Relaxed);
            *self.error_message.write() = None;
        }
    }

    /// Record an error message without changing state.
    pub fn set_error(&self, message: String) {
        *self.error_message.write() = Some(message);
    }

    /// Enter the degraded state after exhausting retries.
    pub fn set_unavailable(&self, attempts: u32) {
        *self.state.write() = ConnectionState::Unavailable;
        *self.error_message.write() = Some(format!(
            "upstream unavailable after {attempts} consecutive failures"
        ));
    }

    /// Record a reconnect attempt.
    pub fn record_reconnect_attempt(&self, attempt: u32) {
        let mut state = self.state.write();
        if *state != ConnectionState::Unavailable {
            *state = ConnectionState::Reconnecting;
        }
        self.reconnect_attempts.store(attempt, Ordering::Relaxed);
    }

    /// Increment ticks received counter.
    pub fn increment_ticks(&self) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dropped malformed message.
    pub fn record_protocol_error(&self, message: String) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
        *self.error_message.write() = Some(message);
    }

    /// Update upstream subscription count.
    pub fn set_subscription_count(&self, count: usize) {
        self.subscription_count.store(count, Ordering::Relaxed);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn get_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Get ticks received count.
    #[must_use]
    pub fn get_ticks_received(&self) -> u64 {
        self.ticks_received.load(Ordering::Relaxed)
    }

    /// Get reconnect attempts count.
    #[must_use]
    pub fn get_reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Capture the current state for reporting.
    #[must_use]
    pub fn snapshot(&self) -> FeedSnapshot {
        let state = self.get_state();
        FeedSnapshot {
            state,
            connected: state == ConnectionState::Connected,
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.error_message.read().clone(),
            reconnect_attempts: self.get_reconnect_attempts(),
            ticks_received: self.get_ticks_received(),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            upstream_symbols: self.subscription_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let state = FeedState::new();
        assert_eq!(state.get_state(), ConnectionState::Disconnected);
        assert!(!state.snapshot().connected);
    }

    #[test]
    fn connect_clears_error_and_attempts() {
        let state = FeedState::new();
        state.record_reconnect_attempt(3);
        state.set_error("boom".to_string());

        state.set_state(ConnectionState::Connected);

        let snapshot = state.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.last_connected_at.is_some());
    }

    #[test]
    fn unavailable_survives_further_attempts() {
        let state = FeedState::new();
        state.set_unavailable(10);
        state.record_reconnect_attempt(11);

        assert_eq!(state.get_state(), ConnectionState::Unavailable);
        assert_eq!(state.get_reconnect_attempts(), 11);

        state.set_state(ConnectionState::Connected);
        assert_eq!(state.get_state(), ConnectionState::Connected);
    }

    #[test]
    fn counters_accumulate() {
        let state = FeedState::new();
        state.increment_ticks();
        state.increment_ticks();
        state.record_protocol_error("bad frame".to_string());
        state.set_subscription_count(4);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.ticks_received, 2);
        assert_eq!(snapshot.protocol_errors, 1);
        assert_eq!(snapshot.upstream_symbols, 4);
        assert_eq!(snapshot.last_error.as_deref(), Some("bad frame"));
    }

    #[test]
    fn state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Unavailable).unwrap(),
            "\"unavailable\""
        );
    }
}
