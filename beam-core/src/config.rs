//! Session tunables. Every field has a default; hosts may load overrides from a file.

use std::time::Duration;

use serde::Deserialize;

/// Core configuration. Chunk size is a protocol constant, see `chunk::CHUNK_SIZE`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Delay between relay delivery attempts while the relay is still connecting (default 100 ms).
    #[serde(default = "default_relay_retry_interval_ms")]
    pub relay_retry_interval_ms: u64,
    /// Delivery attempts before an envelope is dropped (default 20).
    #[serde(default = "default_relay_retry_attempts")]
    pub relay_retry_attempts: u32,
    /// Channel drain notification threshold in bytes (default 1 MiB).
    #[serde(default = "default_buffer_low_watermark")]
    pub buffer_low_watermark: u64,
    /// Channel buffered amount above which chunk sends pause (default 16 MiB).
    #[serde(default = "default_buffer_high_watermark")]
    pub buffer_high_watermark: u64,
    /// Fallback poll interval while paused on backpressure (default 20 ms).
    #[serde(default = "default_drain_poll_interval_ms")]
    pub drain_poll_interval_ms: u64,
}

fn default_relay_retry_interval_ms() -> u64 {
    100
}
fn default_relay_retry_attempts() -> u32 {
    20
}
fn default_buffer_low_watermark() -> u64 {
    1024 * 1024
}
fn default_buffer_high_watermark() -> u64 {
    16 * 1024 * 1024
}
fn default_drain_poll_interval_ms() -> u64 {
    20
}

impl Config {
    pub fn relay_retry_interval(&self) -> Duration {
        Duration::from_millis(self.relay_retry_interval_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_retry_interval_ms: default_relay_retry_interval_ms(),
            relay_retry_attempts: default_relay_retry_attempts(),
            buffer_low_watermark: default_buffer_low_watermark(),
            buffer_high_watermark: default_buffer_high_watermark(),
            drain_poll_interval_ms: default_drain_poll_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let c = Config::default();
        assert_eq!(c.relay_retry_interval(), Duration::from_millis(100));
        assert_eq!(c.relay_retry_attempts, 20);
        assert_eq!(c.buffer_low_watermark, 1 << 20);
        assert_eq!(c.buffer_high_watermark, 16 << 20);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let c: Config = serde_json::from_str(r#"{"relay_retry_attempts": 3}"#).unwrap();
        assert_eq!(c.relay_retry_attempts, 3);
        assert_eq!(c.relay_retry_interval_ms, 100);
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"chunk_size": 1}"#).is_err());
    }
}
