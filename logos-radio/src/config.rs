//! Radio configuration.
//!
//! Every radio and room manager receives its configuration explicitly; there
//! is no process-wide configuration lookup. The struct deserializes with
//! defaults for any missing field, so a partial document is enough.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::queue::{QueueLimits, CHUNK_SIZE, MAX_CHUNKS_IN_QUEUE};
use crate::storage::LogConfig;

/// Configuration for a room's broadcast radio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Directory holding one log file per room
    pub data_dir: PathBuf,
    /// Persistent log settings
    pub log: LogConfig,
    /// Initial piece size when splitting persisted ranges (bytes)
    pub chunk_size: u64,
    /// Upper bound on pieces produced by one split
    pub max_chunks_in_queue: u64,
    /// Delivery loop tick; short-read retries wait this long
    pub tick_interval_ms: u64,
    /// How long a push to a subscriber may block before eviction
    pub send_timeout_ms: u64,
    /// Announcements buffered per intake lane
    pub intake_capacity: usize,
    /// Outgoing packets buffered per subscriber
    pub outbound_capacity: usize,
    /// Commands buffered for the per-room writer task
    pub command_capacity: usize,
    /// How long enqueueing a writer command may wait
    pub command_timeout_ms: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log: LogConfig::default(),
            chunk_size: CHUNK_SIZE,
            max_chunks_in_queue: MAX_CHUNKS_IN_QUEUE,
            tick_interval_ms: 100,
            send_timeout_ms: 10_000,
            intake_capacity: 1024,
            outbound_capacity: 16,
            command_capacity: 256,
            command_timeout_ms: 5_000,
        }
    }
}

impl RadioConfig {
    /// Config for testing (small buffers, short timeouts, given directory).
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            log: LogConfig::for_testing(),
            chunk_size: 64,
            max_chunks_in_queue: 16,
            tick_interval_ms: 10,
            send_timeout_ms: 200,
            intake_capacity: 64,
            outbound_capacity: 4,
            command_capacity: 16,
            command_timeout_ms: 200,
        }
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            chunk_size: self.chunk_size,
            max_chunks: self.max_chunks_in_queue,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_config_default() {
        let config = RadioConfig::default();
        assert_eq!(config.chunk_size, 400 * 1024);
        assert_eq!(config.max_chunks_in_queue, 2048);
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.send_timeout(), Duration::from_secs(10));
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_radio_config_queue_limits() {
        let config = RadioConfig::for_testing("/tmp/radio");
        let limits = config.queue_limits();
        assert_eq!(limits.chunk_size, 64);
        assert_eq!(limits.max_chunks, 16);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/radio"));
    }

    #[test]
    fn test_radio_config_partial_document() {
        let json = r#"{ "data_dir": "/srv/rooms", "log": { "buffer_size": 4096 }, "send_timeout_ms": 2500 }"#;
        let config: RadioConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.data_dir, PathBuf::from("/srv/rooms"));
        assert_eq!(config.log.buffer_size, 4096);
        assert_eq!(config.log.flush_interval_ms, LogConfig::default().flush_interval_ms);
        assert_eq!(config.send_timeout(), Duration::from_millis(2500));
        assert_eq!(config.tick_interval_ms, 100);
    }

    #[test]
    fn test_tick_interval_never_zero() {
        let config = RadioConfig {
            tick_interval_ms: 0,
            ..RadioConfig::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
    }
}
