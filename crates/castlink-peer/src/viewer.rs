//! Viewer: answers the agent's offer and counts the video it receives.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::{IceConfig, SignalingConfig};
use crate::negotiation::{NegotiationSession, Role, SessionState};
use crate::signaling::{self, SignalingChannel};
use crate::webrtc_transport::WebRtcTransport;

#[derive(Debug, Clone, Default)]
pub struct ViewerConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
}

pub async fn run_viewer<F>(config: ViewerConfig, shutdown: F) -> Result<SessionState>
where
    F: Future<Output = ()>,
{
    config.signaling.validate()?;

    let SignalingChannel {
        outbound,
        mut inbound,
        task: signaling_task,
    } = signaling::connect(&config.signaling)
        .await
        .context("connecting to relay")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = WebRtcTransport::new(&config.ice, events_tx).await?;
    transport.receive_tracks();
    transport.accept_control_channels();

    let mut session = NegotiationSession::new(Role::Viewer, transport, outbound);
    info!("waiting for an offer");
    let final_state = session.run(&mut inbound, &mut events_rx, shutdown).await;
    info!(state = %final_state, "viewer session finished");

    drop(session);
    drop(inbound);
    if timeout(Duration::from_secs(5), signaling_task).await.is_err() {
        warn!("signaling task did not stop in time");
    }
    Ok(final_state)
}
