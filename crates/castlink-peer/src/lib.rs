//! castlink peers.
//!
//! The agent offers a video track and feeds it from an external encoder;
//! the viewer answers and receives it. Both negotiate through the relay
//! with a [`negotiation::NegotiationSession`].

#![forbid(unsafe_code)]

pub mod agent;
pub mod capture;
pub mod config;
pub mod negotiation;
pub mod packetizer;
pub mod signaling;
pub mod transport;
pub mod viewer;
pub mod webrtc_transport;

pub use agent::{run_agent, AgentConfig};
pub use capture::{CapturePipeline, EncoderProcess, PacketSink, PipelineExit, PipelineReport};
pub use negotiation::{NegotiationError, NegotiationSession, Role, SessionState};
pub use packetizer::{CaptureFrame, Packetizer};
pub use transport::{ConnectionState, PeerTransport, TransportEvent};
pub use viewer::{run_viewer, ViewerConfig};
