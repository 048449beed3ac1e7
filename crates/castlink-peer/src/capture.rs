//! Encoder subprocess to output track.
//!
//! The pipeline waits until the owning session is connected, then reads
//! fixed-size chunks from the encoder, packetizes each one and writes the
//! packets to the sink one at a time. A slow sink blocks the reader; nothing
//! is queued beyond the chunk in hand.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use castlink_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::config::{CaptureConfig, EncoderConfig};
use crate::negotiation::SessionState;
use crate::packetizer::{CaptureFrame, Packetizer};

const KILL_WAIT: Duration = Duration::from_secs(2);

/// Destination for RTP packets.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn write_packet(&self, packet: &Packet) -> Result<()>;
}

#[async_trait]
impl PacketSink for TrackLocalStaticRTP {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.write_rtp(packet)
            .await
            .map(|_| ())
            .map_err(Error::transport)
    }
}

#[async_trait]
impl<T: PacketSink + ?Sized> PacketSink for Arc<T> {
    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        (**self).write_packet(packet).await
    }
}

/// The external encoder. Killed when dropped.
pub struct EncoderProcess {
    child: Child,
    program: String,
}

impl EncoderProcess {
    pub fn spawn(config: &EncoderConfig) -> Result<(Self, ChildStdout)> {
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::config(format!("failed to start encoder {}: {}", config.program, err))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("encoder stdout was not captured"))?;

        info!(pid = child.id(), program = %config.program, "encoder started");
        Ok((
            Self {
                child,
                program: config.program.clone(),
            },
            stdout,
        ))
    }

    /// Kill the encoder if it is still running and reap it.
    pub async fn terminate(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(program = %self.program, %status, "encoder already exited");
                return;
            }
            Ok(None) => {}
            Err(err) => debug!(program = %self.program, "encoder status unknown: {}", err),
        }

        if let Err(err) = self.child.start_kill() {
            warn!(program = %self.program, "failed to kill encoder: {}", err);
            return;
        }
        match timeout(KILL_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => info!(program = %self.program, %status, "encoder terminated"),
            Ok(Err(err)) => warn!(program = %self.program, "failed to reap encoder: {}", err),
            Err(_) => warn!(program = %self.program, "encoder did not exit within {:?}", KILL_WAIT),
        }
    }
}

/// Why the pipeline stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineExit {
    /// The encoder closed its output.
    SourceEnded,
    SourceFailed(String),
    SinkFailed(String),
    Packetize(String),
    /// The owning session reached a terminal state while streaming.
    SessionEnded(SessionState),
    /// The session ended (or was dropped) before it ever connected.
    NeverConnected,
}

impl PipelineExit {
    /// The encoder is gone; the session owner decides what happens next.
    pub fn source_gone(&self) -> bool {
        matches!(self, PipelineExit::SourceEnded | PipelineExit::SourceFailed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub exit: PipelineExit,
    pub frames: u64,
    pub packets: u64,
    pub bytes: u64,
}

pub struct CapturePipeline<R, S> {
    source: R,
    sink: S,
    packetizer: Packetizer,
    chunk_size: usize,
    write_timeout: Duration,
    encoder: Option<EncoderProcess>,
}

impl<R, S> CapturePipeline<R, S>
where
    R: AsyncRead + Unpin + Send,
    S: PacketSink,
{
    pub fn new(source: R, sink: S, config: &CaptureConfig) -> Result<Self> {
        Ok(Self {
            source,
            sink,
            packetizer: Packetizer::new(config)?,
            chunk_size: config.chunk_size,
            write_timeout: config.write_timeout,
            encoder: None,
        })
    }

    /// Tie the encoder's lifetime to this pipeline.
    pub fn with_encoder(mut self, encoder: EncoderProcess) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Stream until the source ends, the sink fails or the session ends.
    /// The encoder, if attached, is terminated on every exit path.
    pub async fn run(mut self, mut session: watch::Receiver<SessionState>) -> PipelineReport {
        let mut report = PipelineReport {
            exit: PipelineExit::NeverConnected,
            frames: 0,
            packets: 0,
            bytes: 0,
        };

        let gate = session
            .wait_for(|state| *state == SessionState::Connected || state.is_terminal())
            .await
            .map(|state| *state);
        report.exit = match gate {
            Ok(SessionState::Connected) => self.stream(&mut session, &mut report).await,
            Ok(_) | Err(_) => PipelineExit::NeverConnected,
        };

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.terminate().await;
        }

        info!(
            exit = ?report.exit,
            frames = report.frames,
            packets = report.packets,
            bytes = report.bytes,
            "capture pipeline stopped"
        );
        report
    }

    async fn stream(
        &mut self,
        session: &mut watch::Receiver<SessionState>,
        report: &mut PipelineReport,
    ) -> PipelineExit {
        info!(
            ssrc = self.packetizer.ssrc(),
            chunk = self.chunk_size,
            "capture pipeline streaming"
        );
        let started = Instant::now();
        let mut buf = vec![0u8; self.chunk_size];

        loop {
            let n = tokio::select! {
                biased;
                changed = session.changed() => {
                    if changed.is_err() {
                        return PipelineExit::SessionEnded(SessionState::Closed);
                    }
                    let state = *session.borrow_and_update();
                    if state.is_terminal() {
                        return PipelineExit::SessionEnded(state);
                    }
                    continue;
                }
                read = self.source.read(&mut buf) => match read {
                    Ok(0) => return PipelineExit::SourceEnded,
                    Ok(n) => n,
                    Err(err) => return PipelineExit::SourceFailed(err.to_string()),
                },
            };

            let frame = CaptureFrame {
                payload: Bytes::copy_from_slice(&buf[..n]),
                elapsed: started.elapsed(),
            };
            report.frames += 1;
            report.bytes += n as u64;

            let packets = match self.packetizer.packetize(&frame) {
                Ok(packets) => packets,
                Err(err) => return PipelineExit::Packetize(err.to_string()),
            };
            trace!(bytes = n, packets = packets.len(), "chunk packetized");

            for packet in &packets {
                match timeout(self.write_timeout, self.sink.write_packet(packet)).await {
                    Ok(Ok(())) => report.packets += 1,
                    Ok(Err(err)) => return PipelineExit::SinkFailed(err.to_string()),
                    Err(_) => {
                        return PipelineExit::SinkFailed(format!(
                            "write blocked for more than {:?}",
                            self.write_timeout
                        ))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct RecordingSink {
        packets: Arc<Mutex<Vec<Packet>>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn write_packet(&self, packet: &Packet) -> Result<()> {
            let mut packets = self.packets.lock().unwrap();
            if self.fail_after.is_some_and(|limit| packets.len() >= limit) {
                return Err(Error::transport("track closed"));
            }
            packets.push(packet.clone());
            Ok(())
        }
    }

    fn config() -> CaptureConfig {
        CaptureConfig {
            chunk_size: 512,
            max_packet_size: 200,
            ssrc: Some(7),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_streams_until_source_ends() {
        let data = vec![1u8; 2000];
        let sink = RecordingSink::default();
        let (_tx, rx) = watch::channel(SessionState::Connected);

        let pipeline = CapturePipeline::new(Cursor::new(data), sink.clone(), &config()).unwrap();
        let report = pipeline.run(rx).await;

        assert_eq!(report.exit, PipelineExit::SourceEnded);
        assert_eq!(report.bytes, 2000);
        assert_eq!(report.frames, 4);

        let packets = sink.packets.lock().unwrap();
        assert_eq!(packets.len() as u64, report.packets);
        for pair in packets.windows(2) {
            assert_eq!(
                pair[1].header.sequence_number,
                pair[0].header.sequence_number.wrapping_add(1)
            );
            assert!(pair[1].header.timestamp >= pair[0].header.timestamp);
        }
    }

    #[tokio::test]
    async fn test_waits_for_connected() {
        let data = vec![1u8; 100];
        let sink = RecordingSink::default();
        let (tx, rx) = watch::channel(SessionState::RemoteDescriptionSet);

        let pipeline = CapturePipeline::new(Cursor::new(data), sink.clone(), &config()).unwrap();
        let handle = tokio::spawn(pipeline.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.packets.lock().unwrap().is_empty());

        tx.send(SessionState::Connected).unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.exit, PipelineExit::SourceEnded);
        assert!(report.packets > 0);
    }

    #[tokio::test]
    async fn test_never_connected() {
        let data = vec![1u8; 100];
        let sink = RecordingSink::default();
        let (tx, rx) = watch::channel(SessionState::New);
        tx.send(SessionState::Failed).unwrap();

        let report = CapturePipeline::new(&data[..], sink.clone(), &config())
            .unwrap()
            .run(rx)
            .await;
        assert_eq!(report.exit, PipelineExit::NeverConnected);
        assert_eq!(report.frames, 0);
    }

    #[tokio::test]
    async fn test_sink_failure_stops_pipeline() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let sink = RecordingSink {
            fail_after: Some(3),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(SessionState::Connected);

        tokio::io::AsyncWriteExt::write_all(&mut writer, &[0u8; 2048])
            .await
            .unwrap();

        let report = CapturePipeline::new(reader, sink.clone(), &config())
            .unwrap()
            .run(rx)
            .await;
        assert!(matches!(report.exit, PipelineExit::SinkFailed(_)));
        assert_eq!(report.packets, 3);
        assert!(!report.exit.source_gone());
    }

    #[tokio::test]
    async fn test_session_close_stops_idle_pipeline() {
        let (_writer, reader) = tokio::io::duplex(64);
        let sink = RecordingSink::default();
        let (tx, rx) = watch::channel(SessionState::Connected);

        let handle = tokio::spawn(
            CapturePipeline::new(reader, sink, &config())
                .unwrap()
                .run(rx),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(SessionState::Closed).unwrap();

        let report = timeout(Duration::from_secs(1), handle)
            .await
            .expect("pipeline stops promptly")
            .unwrap();
        assert_eq!(report.exit, PipelineExit::SessionEnded(SessionState::Closed));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_killed_on_sink_failure() {
        let encoder = EncoderConfig {
            program: "sh".into(),
            args: vec!["-c".into(), "while true; do printf 0123456789; done".into()],
        };
        let (process, stdout) = EncoderProcess::spawn(&encoder).unwrap();
        let sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(SessionState::Connected);

        let report = timeout(
            Duration::from_secs(5),
            CapturePipeline::new(stdout, sink, &config())
                .unwrap()
                .with_encoder(process)
                .run(rx),
        )
        .await
        .expect("pipeline returns");
        assert!(matches!(report.exit, PipelineExit::SinkFailed(_)));
    }
}
