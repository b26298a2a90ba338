//! Connection state and host clock tracking.

use crate::protocol::now_millis;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::info;

/// Lifecycle of the client's connection to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Offset between the host's wall clock and ours, from `time_sync` frames.
#[derive(Debug, Default)]
pub(crate) struct ClockSync {
    offset_ms: AtomicI64,
    synced: AtomicBool,
}

impl ClockSync {
    /// Record a host timestamp. Returns the new offset.
    pub fn update(&self, server_time: i64) -> i64 {
        let offset = server_time - now_millis();
        self.offset_ms.store(offset, Ordering::SeqCst);
        if !self.synced.swap(true, Ordering::SeqCst) {
            info!(offset_ms = offset, "Clock synchronized with host");
        }
        offset
    }

    /// `None` until the first `time_sync` arrives.
    pub fn offset_ms(&self) -> Option<i64> {
        self.synced
            .load(Ordering::SeqCst)
            .then(|| self.offset_ms.load(Ordering::SeqCst))
    }

    /// Local time corrected by the last known offset.
    pub fn server_time_ms(&self) -> i64 {
        now_millis() + self.offset_ms().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Reconnecting).unwrap(),
            serde_json::json!("reconnecting")
        );
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }

    #[test]
    fn test_clock_offset_unknown_until_synced() {
        let clock = ClockSync::default();
        assert_eq!(clock.offset_ms(), None);

        let offset = clock.update(now_millis() + 60_000);
        assert!((59_000..=60_000).contains(&offset), "offset was {}", offset);
        assert_eq!(clock.offset_ms(), Some(offset));

        let corrected = clock.server_time_ms() - now_millis();
        assert!((59_000..=60_001).contains(&corrected));
    }
}
