//! Broker configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::cache::MAX_UNIQUE_EVENTS;

/// Configuration for the broker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Suppression window for unique events, in milliseconds.
    pub unique_window_ms: u64,
    /// Maximum queued payloads per connection.
    pub max_queue_len: usize,
    /// Maximum distinct uniqueness keys tracked at once.
    pub max_unique_events: usize,
    /// How long a reader waits for one frame before re-checking its loop
    /// condition, in milliseconds.
    pub recv_timeout_ms: u64,
    /// How long a writer waits for one queued payload before re-checking
    /// its loop condition, in milliseconds.
    pub pop_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            unique_window_ms: 5_000,
            max_queue_len: 1024,
            max_unique_events: MAX_UNIQUE_EVENTS,
            recv_timeout_ms: 5_000,
            pop_timeout_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    /// Suppression window as a duration.
    pub fn unique_window(&self) -> Duration {
        Duration::from_millis(self.unique_window_ms)
    }

    /// Reader receive timeout as a duration.
    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    /// Writer pop timeout as a duration.
    pub fn pop_timeout(&self) -> Duration {
        Duration::from_millis(self.pop_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.unique_window(), Duration::from_secs(5));
        assert_eq!(config.max_queue_len, 1024);
        assert_eq!(config.max_unique_events, MAX_UNIQUE_EVENTS);
    }

    #[test]
    fn test_broker_config_partial_deserialization() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"max_queue_len": 16, "unique_window_ms": 250}"#).unwrap();
        assert_eq!(config.max_queue_len, 16);
        assert_eq!(config.unique_window(), Duration::from_millis(250));
        // Unset fields keep their defaults.
        assert_eq!(config.pop_timeout(), Duration::from_secs(1));
    }
}
