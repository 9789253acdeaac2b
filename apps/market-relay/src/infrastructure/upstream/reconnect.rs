//! Reconnection Policy
//!
//! Exponential backoff with jitter for upstream reconnection. After
//! `max_attempts` consecutive failures the policy reports exhaustion but
//! keeps handing out probe delays capped at `max_delay`, so the feed
//! recovers on its own once the upstream is reachable again.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::WebSocketSettings;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Maximum delay between attempts; also the probe interval once exhausted.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Consecutive failures before the upstream is reported unavailable (minimum 1).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 10,
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `WebSocketSettings`.
    #[must_use]
    pub const fn from_websocket_settings(settings: &WebSocketSettings) -> Self {
        Self {
            initial_delay: settings.reconnect_delay_initial,
            max_delay: settings.reconnect_delay_max,
            multiplier: settings.reconnect_delay_multiplier,
            jitter_factor: 0.1,
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// What to do after a failed connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry after `delay`.
    Retry {
        /// Consecutive failures so far.
        attempt: u32,
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Retries exhausted; probe again after `delay`.
    Exhausted {
        /// Consecutive failures so far.
        attempts: u32,
        /// Delay before the next probe.
        delay: Duration,
    },
}

impl Backoff {
    /// Delay before the next attempt.
    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            Self::Retry { delay, .. } | Self::Exhausted { delay, .. } => delay,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use market_relay::infrastructure::upstream::reconnect::{Backoff, ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert!(matches!(policy.next_backoff(), Backoff::Retry { attempt: 1, .. }));
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    pub fn next_backoff(&mut self) -> Backoff {
        self.attempt_count = self.attempt_count.saturating_add(1);

        if self.attempt_count >= self.config.max_attempts.max(1) {
            return Backoff::Exhausted {
                attempts: self.attempt_count,
                delay: self.apply_jitter(self.config.max_delay),
            };
        }

        let delay = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Backoff::Retry {
            attempt: self.attempt_count,
            delay,
        }
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Whether failures have reached the unavailable threshold.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.config.max_attempts && self.attempt_count > 0
    }

    /// Apply jitter to a duration, never going below 1 ms.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration.max(Duration::from_millis(1));
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 10);
    }

    #[test]
    fn exponential_backoff() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 10_000, 2.0, 100));

        let delays: Vec<Duration> = (0..4).map(|_| policy.next_backoff().delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn max_delay_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter(1000, 2000, 4.0, 100));

        let _ = policy.next_backoff();
        assert_eq!(policy.next_backoff().delay(), Duration::from_millis(2000));
        assert_eq!(policy.next_backoff().delay(), Duration::from_millis(2000));
    }

    #[test]
    fn exhaustion_after_max_attempts_then_probes() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 5000, 2.0, 3));

        assert!(matches!(policy.next_backoff(), Backoff::Retry { attempt: 1, .. }));
        assert!(matches!(policy.next_backoff(), Backoff::Retry { attempt: 2, .. }));
        assert!(!policy.is_exhausted());

        assert_eq!(
            policy.next_backoff(),
            Backoff::Exhausted {
                attempts: 3,
                delay: Duration::from_millis(5000)
            }
        );
        assert!(policy.is_exhausted());

        assert_eq!(
            policy.next_backoff(),
            Backoff::Exhausted {
                attempts: 4,
                delay: Duration::from_millis(5000)
            }
        );
    }

    #[test]
    fn reset_restarts_backoff() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 10_000, 2.0, 3));

        let _ = policy.next_backoff();
        let _ = policy.next_backoff();
        let _ = policy.next_backoff();
        assert!(policy.is_exhausted());

        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert!(!policy.is_exhausted());
        assert_eq!(
            policy.next_backoff(),
            Backoff::Retry {
                attempt: 1,
                delay: Duration::from_millis(100)
            }
        );
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.1,
                max_attempts: 10,
            });

            let millis = policy.next_backoff().delay().as_millis();
            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }

    #[test]
    fn zero_delay_is_floored() {
        let mut policy = ReconnectPolicy::new(no_jitter(0, 0, 2.0, 5));
        assert_eq!(policy.next_backoff().delay(), Duration::from_millis(1));
    }

    #[test]
    fn from_settings() {
        let settings = WebSocketSettings {
            reconnect_delay_initial: Duration::from_millis(25),
            max_reconnect_attempts: 4,
            ..WebSocketSettings::default()
        };
        let config = ReconnectConfig::from_websocket_settings(&settings);
        assert_eq!(config.initial_delay, Duration::from_millis(25));
        assert_eq!(config.max_attempts, 4);
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }
}
