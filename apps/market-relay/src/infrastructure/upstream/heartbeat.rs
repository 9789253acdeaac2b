//! Heartbeat Monitor
//!
//! Tracks upstream connection liveness through periodic pings. The
//! connector task owns the socket, so the monitor is driven inline from its
//! select loop: the connector sleeps until [`HeartbeatMonitor::next_check`]
//! and then asks whether to ping or give up.

use std::time::{Duration, Instant};

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence tolerated after a ping before the connection is considered dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the connector should do when the heartbeat deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping frame.
    SendPing,
    /// A ping went unanswered past the pong timeout.
    Timeout,
    /// Nothing is due yet.
    Idle,
}

/// Liveness state for one connection.
///
/// Pings go out every `ping_interval`. The oldest unanswered ping sets a pong
/// deadline `pong_timeout` later; any inbound frame clears it.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_ping: Instant,
    pong_deadline: Option<Instant>,
}

impl HeartbeatMonitor {
    /// Create a monitor for a freshly opened connection.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        Self::starting_at(config, Instant::now())
    }

    fn starting_at(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_ping: now,
            pong_deadline: None,
        }
    }

    /// The instant the connector should next call [`Self::on_tick`].
    #[must_use]
    pub fn next_check(&self) -> Instant {
        let next_ping = self.last_ping + self.config.ping_interval;
        self.pong_deadline.map_or(next_ping, |deadline| deadline.min(next_ping))
    }

    /// Record any inbound frame, including pongs.
    pub fn record_activity(&mut self) {
        self.pong_deadline = None;
    }

    /// Decide what to do once [`Self::next_check`] has passed.
    pub fn on_tick(&mut self) -> HeartbeatAction {
        self.on_tick_at(Instant::now())
    }

    fn on_tick_at(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(deadline) = self.pong_deadline
            && now >= deadline
        {
            tracing::warn!(
                timeout_secs = self.config.pong_timeout.as_secs(),
                "Heartbeat timeout detected"
            );
            return HeartbeatAction::Timeout;
        }

        if now < self.last_ping + self.config.ping_interval {
            return HeartbeatAction::Idle;
        }

        self.last_ping = now;
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(now + self.config.pong_timeout);
        }
        HeartbeatAction::SendPing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig::new(Duration::from_secs(5), Duration::from_secs(10))
    }

    #[test]
    fn default_config_values() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.pong_timeout, Duration::from_secs(60));
    }

    #[test]
    fn from_settings() {
        let settings = WebSocketSettings {
            heartbeat_interval: Duration::from_secs(7),
            heartbeat_timeout: Duration::from_secs(21),
            ..WebSocketSettings::default()
        };
        let config = HeartbeatConfig::from_websocket_settings(&settings);
        assert_eq!(config.ping_interval, Duration::from_secs(7));
        assert_eq!(config.pong_timeout, Duration::from_secs(21));
    }

    #[test]
    fn first_ping_after_one_interval() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::starting_at(config(), start);

        assert_eq!(monitor.next_check(), start + Duration::from_secs(5));
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(4)),
            HeartbeatAction::Idle
        );
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(5)),
            HeartbeatAction::SendPing
        );
    }

    #[test]
    fn activity_clears_outstanding_ping() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::starting_at(config(), start);

        monitor.on_tick_at(start + Duration::from_secs(5));
        monitor.record_activity();
        assert_eq!(monitor.next_check(), start + Duration::from_secs(10));

        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(30)),
            HeartbeatAction::SendPing
        );
    }

    #[test]
    fn timeout_fires_at_pong_deadline() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::starting_at(config(), start);

        // Ping at 5s; the pong deadline is 15s, not a later interval tick.
        monitor.on_tick_at(start + Duration::from_secs(5));
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(10)),
            HeartbeatAction::SendPing
        );
        assert_eq!(monitor.next_check(), start + Duration::from_secs(15));
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(15)),
            HeartbeatAction::Timeout
        );
    }

    #[test]
    fn timeout_shorter_than_interval_is_not_delayed() {
        let start = Instant::now();
        let config = HeartbeatConfig::new(Duration::from_secs(30), Duration::from_secs(5));
        let mut monitor = HeartbeatMonitor::starting_at(config, start);

        monitor.on_tick_at(start + Duration::from_secs(30));
        assert_eq!(monitor.next_check(), start + Duration::from_secs(35));
        assert_eq!(
            monitor.on_tick_at(start + Duration::from_secs(35)),
            HeartbeatAction::Timeout
        );
    }
}
