//! Centralized configuration for the bridge.
//!
//! One `BridgeConfig` is shared by the host and the client; each side reads
//! the options that concern it.

use crate::client::ReconnectPolicy;
use crate::{BridgeError, Result};
use std::time::Duration;

/// Timing and sizing options for both ends of the bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// How often the client sends a heartbeat.
    pub heartbeat_interval: Duration,
    /// Client: silence from the host after which the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Host: a disconnected session older than this is reaped. Also the
    /// idle limit for a connected session that stops sending frames.
    pub session_timeout: Duration,
    /// Default timeout for `call` when the caller does not pick one.
    pub response_timeout: Duration,
    /// How often the host reaper runs.
    pub reap_interval: Duration,
    /// Transport open and handshake timeout.
    pub connect_timeout: Duration,
    /// Largest accepted frame, in bytes.
    pub max_frame_size: usize,
    /// Client reconnection backoff.
    pub reconnect: ReconnectPolicy,
}

impl BridgeConfig {
    pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Reject combinations that would make the timers misbehave.
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("heartbeat_interval", self.heartbeat_interval),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("session_timeout", self.session_timeout),
            ("reap_interval", self.reap_interval),
            ("connect_timeout", self.connect_timeout),
        ];
        for (name, value) in non_zero {
            if value.is_zero() {
                return Err(BridgeError::Config {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(BridgeError::Config {
                message: format!(
                    "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                    self.heartbeat_timeout, self.heartbeat_interval
                ),
            });
        }

        if self.max_frame_size == 0 {
            return Err(BridgeError::Config {
                message: "max_frame_size must be greater than zero".to_string(),
            });
        }

        self.reconnect.validate()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Self::DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: Self::DEFAULT_HEARTBEAT_TIMEOUT,
            session_timeout: Self::DEFAULT_SESSION_TIMEOUT,
            response_timeout: Self::DEFAULT_RESPONSE_TIMEOUT,
            reap_interval: Self::DEFAULT_REAP_INTERVAL,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            max_frame_size: Self::MAX_FRAME_SIZE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}
