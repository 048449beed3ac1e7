//! Capture pipeline against a real subprocess.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use castlink_common::{Envelope, IceCandidate, Result, SessionDescription};
use castlink_peer::config::{CaptureConfig, EncoderConfig};
use castlink_peer::{
    CapturePipeline, ConnectionState, EncoderProcess, NegotiationSession, PacketSink,
    PeerTransport, PipelineExit, Role, SessionState, TransportEvent,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use webrtc::rtp::packet::Packet;

struct NullTransport;

#[async_trait]
impl PeerTransport for NullTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer("v=0"))
    }
    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer("v=0"))
    }
    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        Ok(())
    }
    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<()> {
        Ok(())
    }
    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<()> {
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct CollectingSink(Arc<Mutex<Vec<Packet>>>);

#[async_trait]
impl PacketSink for CollectingSink {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.0.lock().unwrap().push(packet.clone());
        Ok(())
    }
}

async fn connected_session() -> (NegotiationSession<NullTransport>, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(8);
    let mut session = NegotiationSession::new(Role::Viewer, NullTransport, tx);
    session.handle_envelope(Envelope::offer("v=0")).await.unwrap();
    session
        .handle_transport_event(TransportEvent::StateChanged(ConnectionState::Connected))
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    (session, rx)
}

#[tokio::test]
async fn test_encoder_exit_mid_stream_leaves_session_alone() {
    let (session, _outbound) = connected_session().await;

    let encoder = EncoderConfig {
        program: "sh".into(),
        args: vec!["-c".into(), "head -c 20000 /dev/zero".into()],
    };
    let (process, stdout) = EncoderProcess::spawn(&encoder).unwrap();
    let sink = CollectingSink::default();
    let config = CaptureConfig {
        ssrc: Some(42),
        ..Default::default()
    };

    let pipeline = CapturePipeline::new(stdout, sink.clone(), &config)
        .unwrap()
        .with_encoder(process);
    let report = timeout(Duration::from_secs(5), pipeline.run(session.subscribe()))
        .await
        .expect("pipeline stops when the encoder exits");

    assert_eq!(report.exit, PipelineExit::SourceEnded);
    assert!(report.exit.source_gone());
    assert_eq!(report.bytes, 20_000);
    assert_eq!(session.state(), SessionState::Connected);

    let packets = sink.0.lock().unwrap();
    assert_eq!(packets.len() as u64, report.packets);
    assert!(packets.iter().all(|p| p.header.ssrc == 42));
    for pair in packets.windows(2) {
        assert_eq!(
            pair[1].header.sequence_number,
            pair[0].header.sequence_number.wrapping_add(1)
        );
        assert!(pair[1].header.timestamp >= pair[0].header.timestamp);
    }
}

#[tokio::test]
async fn test_missing_encoder_is_a_config_error() {
    let encoder = EncoderConfig {
        program: "/nonexistent/castlink-encoder".into(),
        args: vec![],
    };
    assert!(EncoderProcess::spawn(&encoder).is_err());
}
