//! Relay configuration.

use std::net::SocketAddr;
use std::time::Duration;

use clap::ValueEnum;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_SIGNAL_PATH: &str = "/signal";
pub const DEFAULT_OUTBOX_CAPACITY: usize = 64;
pub const DEFAULT_DISPATCH_CAPACITY: usize = 1024;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
/// Peers ping every 30s; a pong is owed within 10s.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 40;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// What to discard when a client's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Keep the queue as is and discard the envelope being delivered.
    DropNewest,
    /// Evict the oldest queued envelope to make room.
    DropOldest,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub signal_path: String,
    pub outbox_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub dispatch_capacity: usize,
    pub max_message_bytes: usize,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            signal_path: DEFAULT_SIGNAL_PATH.to_string(),
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
            overflow_policy: OverflowPolicy::DropOldest,
            dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> castlink_common::Result<()> {
        if !self.signal_path.starts_with('/') {
            return Err(castlink_common::Error::config(format!(
                "signal path must start with '/': {}",
                self.signal_path
            )));
        }
        if self.outbox_capacity == 0 || self.dispatch_capacity == 0 {
            return Err(castlink_common::Error::config(
                "queue capacities must be greater than zero",
            ));
        }
        if self.idle_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(castlink_common::Error::config(
                "timeouts must be greater than zero",
            ));
        }
        Ok(())
    }
}
