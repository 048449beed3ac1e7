//! Peer configuration.
//!
//! Plain structs with defaults; `main.rs` fills them from clap arguments.

use std::time::Duration;

use castlink_common::{Error, Result};
use clap::ValueEnum;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/signal";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_ENCODER_PROGRAM: &str = "ffmpeg";
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1200;
pub const DEFAULT_CLOCK_RATE: u32 = 90_000;
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 5;

/// Smallest packet that still leaves room for an RTP header and payload.
pub const MIN_PACKET_SIZE: usize = 64;

pub const DEFAULT_ENCODER_ARGS: &str =
    "-f avfoundation -i 1 -vcodec libvpx -deadline realtime -f ivf -";

/// Whitespace-separated argument list; no shell quoting.
pub fn split_args(args: &str) -> Vec<String> {
    args.split_whitespace().map(str::to_owned).collect()
}

pub fn default_encoder_args() -> Vec<String> {
    split_args(DEFAULT_ENCODER_ARGS)
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl SignalingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(Error::config("relay url must not be empty"));
        }
        if self.connect_timeout.is_zero()
            || self.ping_interval.is_zero()
            || self.pong_timeout.is_zero()
        {
            return Err(Error::config(
                "signaling timeouts and ping interval must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
        }
    }
}

/// External encoder command. One agent process owns one encoder.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_ENCODER_PROGRAM.to_string(),
            args: default_encoder_args(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Bytes requested per read of the encoder stream.
    pub chunk_size: usize,
    /// Upper bound on a serialized RTP packet, header included.
    pub max_packet_size: usize,
    pub clock_rate: u32,
    pub payload_type: u8,
    /// Random when unset.
    pub ssrc: Option<u32>,
    pub write_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            clock_rate: DEFAULT_CLOCK_RATE,
            payload_type: DEFAULT_PAYLOAD_TYPE,
            ssrc: None,
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk size must be greater than zero"));
        }
        if self.max_packet_size < MIN_PACKET_SIZE {
            return Err(Error::config(format!(
                "max packet size must be at least {} bytes",
                MIN_PACKET_SIZE
            )));
        }
        if self.clock_rate == 0 {
            return Err(Error::config("clock rate must be greater than zero"));
        }
        if self.payload_type > 127 {
            return Err(Error::config("payload type must fit in 7 bits"));
        }
        Ok(())
    }
}

/// What the agent does once the encoder stream ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceEndPolicy {
    /// Close the negotiation session and exit.
    Close,
    /// Leave the session up without media.
    Keep,
}
