//! [`PeerTransport`] backed by the `webrtc` crate.

use std::sync::Arc;

use async_trait::async_trait;
use castlink_common::{Error, IceCandidate, Result, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceConfig;
use crate::transport::{ConnectionState, PeerTransport, TransportEvent};

pub const CONTROL_CHANNEL_LABEL: &str = "control";

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectionState::New
            }
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

fn from_candidate_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(Error::transport)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(Error::transport(format!(
            "unsupported description type {}",
            other
        ))),
    }
}

/// VP8 output track for the capture pipeline.
pub fn new_video_track() -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
        "video".to_owned(),
        "castlink".to_owned(),
    ))
}

#[derive(Clone)]
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
}

impl WebRtcTransport {
    /// Build a peer connection and route its candidate and state callbacks
    /// into `events`.
    pub async fn new(
        ice: &IceConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(Error::transport)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(Error::transport)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(Error::transport)?,
        );

        let candidate_tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            Box::pin(async move {
                let event = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => {
                            TransportEvent::CandidateDiscovered(from_candidate_init(init))
                        }
                        Err(err) => {
                            warn!("failed to serialize local candidate: {}", err);
                            return;
                        }
                    },
                    None => TransportEvent::GatheringComplete,
                };
                let _ = tx.send(event);
            })
        }));

        let state_tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                debug!("peer connection state: {}", state);
                let _ = tx.send(TransportEvent::StateChanged(state.into()));
            })
        }));

        Ok(Self { pc })
    }

    /// Attach an outbound video track and keep its RTCP flowing.
    pub async fn add_video_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<()> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(Error::transport)?;

        // Interceptors (NACK, reports) only run while RTCP is being read.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((packets, _)) = sender.read(&mut buf).await {
                trace!(count = packets.len(), "rtcp received");
            }
        });
        Ok(())
    }

    /// Open the `control` data channel and log what arrives on it.
    pub async fn open_control_channel(&self) -> Result<Arc<RTCDataChannel>> {
        let channel = self
            .pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, None)
            .await
            .map_err(Error::transport)?;
        log_control_channel(&channel);
        Ok(channel)
    }

    /// Log control messages on data channels opened by the remote side.
    pub fn accept_control_channels(&self) {
        self.pc.on_data_channel(Box::new(|channel: Arc<RTCDataChannel>| {
            Box::pin(async move {
                if channel.label() == CONTROL_CHANNEL_LABEL {
                    log_control_channel(&channel);
                } else {
                    debug!(label = channel.label(), "ignoring data channel");
                }
            })
        }));
    }

    /// Count RTP packets on every incoming track.
    pub fn receive_tracks(&self) {
        self.pc.on_track(Box::new(
            |track: Arc<TrackRemote>,
             _receiver: Arc<RTCRtpReceiver>,
             _transceiver: Arc<RTCRtpTransceiver>| {
                Box::pin(async move {
                    info!(ssrc = track.ssrc(), "remote track started");
                    tokio::spawn(drain_remote_track(track));
                })
            },
        ));
    }
}

fn log_control_channel(channel: &Arc<RTCDataChannel>) {
    let label = channel.label().to_owned();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            info!(%label, "data channel open");
        })
    }));
    channel.on_message(Box::new(|msg: DataChannelMessage| {
        Box::pin(async move {
            if msg.is_string {
                info!("control message: {}", String::from_utf8_lossy(&msg.data));
            } else {
                debug!(bytes = msg.data.len(), "binary control message");
            }
        })
    }));
}

async fn drain_remote_track(track: Arc<TrackRemote>) {
    const REPORT_EVERY: u64 = 500;
    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;
    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                packets += 1;
                bytes += packet.payload.len() as u64;
                if packets % REPORT_EVERY == 0 {
                    info!(ssrc = track.ssrc(), packets, bytes, "receiving video");
                }
            }
            Err(err) => {
                info!(ssrc = track.ssrc(), packets, bytes, "remote track ended: {}", err);
                break;
            }
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(Error::transport)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(Error::transport)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(Error::transport)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(Error::transport)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(Error::transport)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await.map_err(Error::transport)
    }
}
