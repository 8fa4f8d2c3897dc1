//! Client and transport configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Client-level configuration for call timeouts and fault recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout applied to calls issued without an explicit timeout, in milliseconds.
    pub default_call_timeout_ms: u64,
    /// Lower bound for explicit call timeouts, in milliseconds.
    pub min_call_timeout_ms: u64,
    /// Chunk size used when draining a connection's read buffer after a fault.
    pub drain_chunk_size: usize,
}

impl ClientConfig {
    /// Normalizes a caller-supplied timeout.
    ///
    /// `None` becomes the default timeout; anything shorter than the minimum
    /// (including zero) is raised to the minimum.
    #[must_use]
    pub fn call_timeout(&self, requested: Option<Duration>) -> Duration {
        let min = Duration::from_millis(self.min_call_timeout_ms);
        match requested {
            None => Duration::from_millis(self.default_call_timeout_ms).max(min),
            Some(timeout) => timeout.max(min),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: 5_000,
            min_call_timeout_ms: 1_000,
            drain_chunk_size: 128,
        }
    }
}

/// Per-connection settings handed to the transport factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Upper bound for one exchange, in milliseconds. `None` means no limit.
    pub request_timeout_ms: Option<u64>,
    /// Overrides the content type derived from the protocol kind.
    pub content_type: Option<String>,
    /// Extra headers sent with every exchange.
    pub headers: Vec<(String, String)>,
    /// Smallest capacity allocated for a call's write buffer, in bytes.
    pub min_write_capacity: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: None,
            content_type: None,
            headers: Vec::new(),
            min_write_capacity: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.default_call_timeout_ms, 5_000);
        assert_eq!(config.min_call_timeout_ms, 1_000);
        assert_eq!(config.drain_chunk_size, 128);
    }

    #[test]
    fn unspecified_timeout_uses_default() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout(None), Duration::from_secs(5));
    }

    #[test]
    fn short_timeouts_are_clamped_to_minimum() {
        let config = ClientConfig::default();
        assert_eq!(config.call_timeout(Some(Duration::ZERO)), Duration::from_secs(1));
        assert_eq!(
            config.call_timeout(Some(Duration::from_millis(300))),
            Duration::from_secs(1)
        );
        assert_eq!(
            config.call_timeout(Some(Duration::from_millis(2_500))),
            Duration::from_millis(2_500)
        );
    }

    #[test]
    fn transport_settings_defaults() {
        let settings = TransportSettings::default();
        assert!(settings.request_timeout_ms.is_none());
        assert!(settings.content_type.is_none());
        assert!(settings.headers.is_empty());
        assert_eq!(settings.min_write_capacity, 512);
    }
}
