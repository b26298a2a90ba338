//! Reconnection backoff.
//!
//! Delay for attempt `n` (0-indexed) is `min(base_delay * growth_factor^n, max_delay)`,
//! optionally scaled by a random jitter factor.

use crate::{BridgeError, Result};
use rand::Rng;
use std::time::Duration;

/// Configuration for client reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (2.0 doubles the delay each attempt).
    pub growth_factor: f64,
    /// Failed retries allowed before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Scale each delay by a random factor in `[0.5, 1.5)`.
    ///
    /// Delays are then no longer monotonic across attempts.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            growth_factor: 2.0,
            max_attempts: None,
            jitter: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_growth_factor(mut self, factor: f64) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another retry is allowed after `attempt` failed retries.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let multiplier = self.growth_factor.powi(exponent);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let max_secs = self.max_delay.as_secs_f64();
        // powi overflows to infinity for large attempts; min() keeps the cap
        let capped_secs = if delay_secs.is_finite() {
            delay_secs.min(max_secs)
        } else {
            max_secs
        };

        let final_secs = if self.jitter {
            let jitter_factor = rand::rng().random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(max_secs)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(BridgeError::Config {
                message: "reconnect base_delay must be greater than zero".to_string(),
            });
        }
        if self.max_delay < self.base_delay {
            return Err(BridgeError::Config {
                message: format!(
                    "reconnect max_delay ({:?}) is below base_delay ({:?})",
                    self.max_delay, self.base_delay
                ),
            });
        }
        if !self.growth_factor.is_finite() || self.growth_factor < 1.0 {
            return Err(BridgeError::Config {
                message: format!(
                    "reconnect growth_factor must be >= 1.0, got {}",
                    self.growth_factor
                ),
            });
        }
        Ok(())
    }
}
