//! Scheduling: timers the host arms on behalf of the core, bounded retry policy, and
//! backpressure watermarks. The core never sleeps; it asks the host to call back.

use std::time::Duration;

use crate::config::Config;

/// Timers the host runs for the core. When one fires the host calls `PeerSession::on_timer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Retry queued signaling envelopes while the relay is still connecting.
    RelayRetry,
    /// Re-check the channel buffer while the sender is paused and no drain signal arrived.
    DrainPoll,
}

/// Bounded retry: fixed delay between attempts, fixed number of attempts (the first send counts).
///
/// The relay client runs one timer for its whole queue, so an envelope queued shortly
/// before a tick has that attempt counted after less than `interval`. Its total wait can
/// fall up to one `interval` short of `(max_attempts - 1) * interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.relay_retry_interval(), config.relay_retry_attempts)
    }

    /// True if another attempt may be made after `attempts` unsuccessful ones.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Channel send-buffer watermarks. Sending pauses above `high` and resumes at or below `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

impl Watermarks {
    pub fn from_config(config: &Config) -> Self {
        Self {
            low: config.buffer_low_watermark,
            high: config.buffer_high_watermark.max(config.buffer_low_watermark),
        }
    }

    pub fn should_pause(&self, buffered: u64) -> bool {
        buffered > self.high
    }

    pub fn may_resume(&self, buffered: u64) -> bool {
        buffered <= self.low
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}
