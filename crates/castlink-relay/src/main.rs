#![forbid(unsafe_code)]

//! castlink-relay - WebSocket signaling relay.
//!
//! Accepts WebSocket connections on the signaling path and fans each
//! offer/answer/candidate envelope out to every other connected client.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use castlink_common::helpers::env_bool;
use castlink_relay::config::{
    DEFAULT_DISPATCH_CAPACITY, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_OUTBOX_CAPACITY, DEFAULT_SIGNAL_PATH, DEFAULT_WRITE_TIMEOUT_SECS,
};
use castlink_relay::{OverflowPolicy, RelayConfig};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "castlink-relay")]
#[command(about = "castlink signaling relay - fans out session negotiation messages")]
struct Args {
    /// TCP listen address
    #[arg(long, env = "CASTLINK_RELAY_LISTEN", default_value = castlink_relay::config::DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// WebSocket upgrade path
    #[arg(long, env = "CASTLINK_RELAY_PATH", default_value = DEFAULT_SIGNAL_PATH)]
    path: String,

    /// Per-client outbound queue length
    #[arg(long, env = "CASTLINK_RELAY_OUTBOX", default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox_capacity: usize,

    /// What to drop when a client's queue is full
    #[arg(long, env = "CASTLINK_RELAY_OVERFLOW", value_enum, default_value_t = OverflowPolicy::DropOldest)]
    overflow: OverflowPolicy,

    /// Central dispatch queue length
    #[arg(long, env = "CASTLINK_RELAY_DISPATCH", default_value_t = DEFAULT_DISPATCH_CAPACITY)]
    dispatch_capacity: usize,

    /// Largest accepted WebSocket message in bytes
    #[arg(long, env = "CASTLINK_RELAY_MAX_MESSAGE", default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Seconds without any inbound frame before a client is dropped
    #[arg(long, env = "CASTLINK_RELAY_IDLE_TIMEOUT", default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout: u64,

    /// Seconds a single outbound write may take
    #[arg(long, env = "CASTLINK_RELAY_WRITE_TIMEOUT", default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    write_timeout: u64,

    /// Allow binding to a non-loopback address
    #[arg(long, default_value_t = false)]
    allow_public_bind: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            listen: self.listen,
            signal_path: self.path,
            outbox_capacity: self.outbox_capacity,
            overflow_policy: self.overflow,
            dispatch_capacity: self.dispatch_capacity,
            max_message_bytes: self.max_message_bytes,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            write_timeout: Duration::from_secs(self.write_timeout),
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    castlink_common::init_tracing_with_default(&format!(
        "{},tower_http=warn,hyper=warn",
        args.log_level
    ));

    let allow_public =
        args.allow_public_bind || env_bool("CASTLINK_RELAY_ALLOW_PUBLIC_BIND", false);
    if !args.listen.ip().is_loopback() && !allow_public {
        return Err(anyhow::anyhow!(
            "refusing non-loopback relay bind without --allow-public-bind or CASTLINK_RELAY_ALLOW_PUBLIC_BIND=1"
        ));
    }

    info!("Starting castlink-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config();
    config.validate()?;

    let listener = TcpListener::bind(config.listen).await?;
    castlink_relay::serve_with_shutdown(listener, config, shutdown_signal()).await?;

    Ok(())
}
