//! Capture agent: offers a VP8 track and streams the encoder into it once
//! the viewer is connected.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{error, info, warn};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::capture::{CapturePipeline, EncoderProcess, PipelineReport};
use crate::config::{CaptureConfig, EncoderConfig, IceConfig, SignalingConfig, SourceEndPolicy};
use crate::negotiation::{NegotiationSession, Role, SessionState};
use crate::signaling::{self, SignalingChannel};
use crate::webrtc_transport::{new_video_track, WebRtcTransport};

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub signaling: SignalingConfig,
    pub ice: IceConfig,
    pub encoder: EncoderConfig,
    pub capture: CaptureConfig,
    pub source_end: SourceEndPolicy,
}

/// Waits for the session to connect, then runs the encoder into `track`.
/// Returns `None` if the session never connected or the encoder could not
/// be started.
async fn capture_when_connected(
    encoder: EncoderConfig,
    capture: CaptureConfig,
    track: Arc<TrackLocalStaticRTP>,
    mut session: watch::Receiver<SessionState>,
) -> Option<PipelineReport> {
    let connected = session
        .wait_for(|state| *state == SessionState::Connected || state.is_terminal())
        .await
        .map(|state| *state == SessionState::Connected)
        .unwrap_or(false);
    if !connected {
        info!("session ended before connecting, encoder not started");
        return None;
    }

    let (process, stdout) = match EncoderProcess::spawn(&encoder) {
        Ok(spawned) => spawned,
        Err(err) => {
            error!("{}", err);
            return None;
        }
    };

    match CapturePipeline::new(stdout, track, &capture) {
        Ok(pipeline) => Some(pipeline.with_encoder(process).run(session).await),
        Err(err) => {
            error!("capture pipeline rejected its configuration: {}", err);
            None
        }
    }
}

pub async fn run_agent<F>(config: AgentConfig, shutdown: F) -> Result<SessionState>
where
    F: Future<Output = ()>,
{
    config.signaling.validate()?;
    config.capture.validate()?;

    let SignalingChannel {
        outbound,
        mut inbound,
        task: signaling_task,
    } = signaling::connect(&config.signaling)
        .await
        .context("connecting to relay")?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let transport = WebRtcTransport::new(&config.ice, events_tx).await?;
    let track = new_video_track();
    transport.add_video_track(track.clone()).await?;
    let _control = transport.open_control_channel().await?;

    let mut session = NegotiationSession::new(Role::Agent, transport, outbound);
    session.start_offer().await.context("sending offer")?;

    let (source_tx, source_rx) = oneshot::channel::<PipelineReport>();
    let capture = tokio::spawn({
        let state = session.subscribe();
        let encoder = config.encoder.clone();
        let capture = config.capture.clone();
        async move {
            let report = capture_when_connected(encoder, capture, track, state).await;
            if let Some(report) = report.as_ref().filter(|r| r.exit.source_gone()) {
                let _ = source_tx.send(report.clone());
            }
            report
        }
    });

    let policy = config.source_end;
    let source_gone = async move {
        match source_rx.await {
            Ok(report) if policy == SourceEndPolicy::Close => {
                info!(exit = ?report.exit, "encoder gone, closing session");
            }
            Ok(report) => {
                warn!(exit = ?report.exit, "encoder gone, keeping session without media");
                std::future::pending::<()>().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    let stop = async move {
        tokio::select! {
            _ = shutdown => {}
            _ = source_gone => {}
        }
    };

    let final_state = session.run(&mut inbound, &mut events_rx, stop).await;
    info!(state = %final_state, "agent session finished");

    // Dropping the session closes the state watch, which stops the pipeline.
    drop(session);
    match timeout(TEARDOWN_TIMEOUT, capture).await {
        Ok(Ok(Some(report))) => info!(
            frames = report.frames,
            packets = report.packets,
            bytes = report.bytes,
            "capture finished"
        ),
        Ok(Ok(None)) => {}
        Ok(Err(err)) => warn!("capture task panicked: {}", err),
        Err(_) => warn!("capture task did not stop within {:?}", TEARDOWN_TIMEOUT),
    }

    drop(inbound);
    if timeout(TEARDOWN_TIMEOUT, signaling_task).await.is_err() {
        warn!("signaling task did not stop within {:?}", TEARDOWN_TIMEOUT);
    }

    Ok(final_state)
}
