//! Upstream link configuration.

use std::time::Duration;

use relaybridge_core::config::UpstreamSettings;

/// Configuration for the bridge's connection to the upstream aggregator.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Aggregator URL (e.g., "ws://aggregator:3127/ws").
    pub url: String,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl UpstreamConfig {
    pub fn new(url: impl Into<String>, settings: &UpstreamSettings) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectPolicy::from_settings(settings),
        }
    }
}

/// Reconnection policy. A multiplier of 1.0 gives a fixed delay.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub const fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            initial_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            multiplier: settings.backoff_multiplier,
            max_attempts: settings.max_attempts,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let delay_ms = base_ms * self.multiplier.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_fixed_three_seconds() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(3));
        assert!(policy.max_attempts.is_none());
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn retry_with_max_attempts() {
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn retry_unlimited() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(u32::MAX));
    }

    #[test]
    fn built_from_settings() {
        let settings = UpstreamSettings {
            reconnect_delay_ms: 250,
            backoff_multiplier: 1.5,
            max_delay_ms: 1000,
            max_attempts: Some(4),
        };
        let config = UpstreamConfig::new("ws://127.0.0.1:9/ws", &settings);
        assert_eq!(config.url, "ws://127.0.0.1:9/ws");
        assert_eq!(config.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_delay, Duration::from_secs(1));
        assert_eq!(config.reconnect.max_attempts, Some(4));
    }
}
