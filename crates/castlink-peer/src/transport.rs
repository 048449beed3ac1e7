//! Seam between negotiation and the transport-session library.
//!
//! [`NegotiationSession`](crate::negotiation::NegotiationSession) only talks
//! to a [`PeerTransport`]; the production implementation lives in
//! [`crate::webrtc_transport`].

use async_trait::async_trait;
use castlink_common::{IceCandidate, Result, SessionDescription};

/// Connection state as reported by the transport library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications pushed from the transport into the session driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered and must be sent to the remote side.
    CandidateDiscovered(IceCandidate),
    GatheringComplete,
    StateChanged(ConnectionState),
}

/// Operations the negotiation state machine drives on the transport.
///
/// Every method reports failure as [`castlink_common::Error::Transport`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    async fn close(&self) -> Result<()>;
}
