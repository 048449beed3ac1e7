#![forbid(unsafe_code)]

//! castlink-peer - capture agent and viewer.

use std::time::Duration;

use anyhow::Result;
use castlink_peer::config::{
    split_args, CaptureConfig, EncoderConfig, IceConfig, SignalingConfig, SourceEndPolicy,
    DEFAULT_CHUNK_SIZE, DEFAULT_CLOCK_RATE, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_ENCODER_ARGS,
    DEFAULT_ENCODER_PROGRAM, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PAYLOAD_TYPE,
    DEFAULT_PING_INTERVAL_SECS, DEFAULT_PONG_TIMEOUT_SECS, DEFAULT_RELAY_URL,
    DEFAULT_STUN_SERVER, DEFAULT_WRITE_TIMEOUT_SECS,
};
use castlink_peer::{run_agent, run_viewer, AgentConfig, SessionState, ViewerConfig};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "castlink-peer")]
#[command(about = "castlink peer - negotiate a WebRTC session through the relay")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// Relay WebSocket URL
    #[arg(long, global = true, env = "CASTLINK_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    relay_url: String,

    /// STUN server URL (repeatable)
    #[arg(long = "stun", global = true, env = "CASTLINK_STUN", value_delimiter = ',', default_value = DEFAULT_STUN_SERVER)]
    stun_servers: Vec<String>,

    /// Seconds between keepalive pings to the relay
    #[arg(long, global = true, env = "CASTLINK_PING_INTERVAL", default_value_t = DEFAULT_PING_INTERVAL_SECS)]
    ping_interval: u64,

    /// Seconds to wait for a pong before dropping the relay connection
    #[arg(long, global = true, env = "CASTLINK_PONG_TIMEOUT", default_value_t = DEFAULT_PONG_TIMEOUT_SECS)]
    pong_timeout: u64,

    /// Seconds allowed for the relay handshake
    #[arg(long, global = true, env = "CASTLINK_CONNECT_TIMEOUT", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

impl CommonArgs {
    fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            url: self.relay_url.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            ping_interval: Duration::from_secs(self.ping_interval),
            pong_timeout: Duration::from_secs(self.pong_timeout),
        }
    }

    fn ice(&self) -> IceConfig {
        IceConfig {
            stun_servers: self.stun_servers.clone(),
        }
    }
}

#[derive(ClapArgs, Debug)]
struct AgentArgs {
    /// Encoder program
    #[arg(long, env = "CASTLINK_ENCODER", default_value = DEFAULT_ENCODER_PROGRAM)]
    encoder: String,

    /// Encoder arguments, whitespace separated; output must go to stdout
    #[arg(long, env = "CASTLINK_ENCODER_ARGS", allow_hyphen_values = true, default_value = DEFAULT_ENCODER_ARGS)]
    encoder_args: String,

    /// Bytes read from the encoder per chunk
    #[arg(long, env = "CASTLINK_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,

    /// Largest RTP packet in bytes, header included
    #[arg(long, env = "CASTLINK_MAX_PACKET", default_value_t = DEFAULT_MAX_PACKET_SIZE)]
    max_packet_size: usize,

    /// RTP clock rate in Hz
    #[arg(long, env = "CASTLINK_CLOCK_RATE", default_value_t = DEFAULT_CLOCK_RATE)]
    clock_rate: u32,

    /// RTP payload type
    #[arg(long, env = "CASTLINK_PAYLOAD_TYPE", default_value_t = DEFAULT_PAYLOAD_TYPE)]
    payload_type: u8,

    /// RTP SSRC; random when unset
    #[arg(long, env = "CASTLINK_SSRC")]
    ssrc: Option<u32>,

    /// Seconds a single packet write may block
    #[arg(long, env = "CASTLINK_WRITE_TIMEOUT", default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    write_timeout: u64,

    /// What to do with the session once the encoder stops
    #[arg(long, env = "CASTLINK_SOURCE_END", value_enum, default_value_t = SourceEndPolicy::Close)]
    on_source_end: SourceEndPolicy,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Offer a video track and stream the encoder output into it
    Agent(AgentArgs),

    /// Answer an offer and receive the video track
    Viewer,
}

fn agent_config(common: &CommonArgs, args: AgentArgs) -> AgentConfig {
    AgentConfig {
        signaling: common.signaling(),
        ice: common.ice(),
        encoder: EncoderConfig {
            program: args.encoder,
            args: split_args(&args.encoder_args),
        },
        capture: CaptureConfig {
            chunk_size: args.chunk_size,
            max_packet_size: args.max_packet_size,
            clock_rate: args.clock_rate,
            payload_type: args.payload_type,
            ssrc: args.ssrc,
            write_timeout: Duration::from_secs(args.write_timeout),
        },
        source_end: args.on_source_end,
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
        "{},webrtc=warn,webrtc_ice=warn",
        args.common.log_level
    ));

    info!("Starting castlink-peer v{}", env!("CARGO_PKG_VERSION"));

    let final_state = match args.command {
        Command::Agent(agent) => {
            let config = agent_config(&args.common, agent);
            run_agent(config, shutdown_signal()).await?
        }
        Command::Viewer => {
            let config = ViewerConfig {
                signaling: args.common.signaling(),
                ice: args.common.ice(),
            };
            run_viewer(config, shutdown_signal()).await?
        }
    };

    if final_state == SessionState::Failed {
        return Err(anyhow::anyhow!("session failed"));
    }
    Ok(())
}
