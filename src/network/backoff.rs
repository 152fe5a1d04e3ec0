//! Reconnection backoff policy
//!
//! Capped exponential backoff with optional jitter, used by the broker
//! transport after the socket drops.

use std::time::Duration;

use rand::Rng;

use crate::config::BrokerConfig;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Delay before the first reconnection attempt
    pub backoff_initial: Duration,
    /// Upper bound for any delay
    pub backoff_max: Duration,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay
    pub jitter_enabled: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl From<&BrokerConfig> for ReconnectionPolicy {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            backoff_initial: Duration::from_millis(config.reconnect_initial_ms),
            backoff_max: Duration::from_millis(config.reconnect_max_ms),
            backoff_multiplier: config.reconnect_multiplier,
            jitter_enabled: config.reconnect_jitter,
        }
    }
}

impl ReconnectionPolicy {
    /// Backoff before attempt number `attempt` (0-indexed)
    ///
    /// The jitter is added after clamping, so a delay never exceeds
    /// `backoff_max * 1.25`.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.backoff_initial.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped_ms = base_ms.min(self.backoff_max.as_millis() as f64);

        let final_ms = if self.jitter_enabled && capped_ms > 0.0 {
            capped_ms + rand::thread_rng().gen_range(0.0..capped_ms * 0.25)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}
