//! Encoder bytes to RTP packets.
//!
//! Chunks read from the encoder are not aligned to encoded frames, so each
//! chunk is handed to the payloader as-is. Every packet of one chunk shares
//! a timestamp; the marker bit is set on the last one.

use std::time::Duration;

use bytes::Bytes;
use castlink_common::{Error, Result};
use rand::Rng;
use webrtc::rtp::codecs::vp8::Vp8Payloader;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::rtp::packetizer::Payloader;

use crate::config::CaptureConfig;

/// Fixed RTP header without CSRCs or extensions.
pub const RTP_HEADER_SIZE: usize = 12;

/// One read of the encoder stream.
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub payload: Bytes,
    /// Time since the stream started.
    pub elapsed: Duration,
}

pub struct Packetizer {
    payloader: Box<dyn Payloader + Send + Sync>,
    payload_type: u8,
    ssrc: u32,
    clock_rate: u32,
    max_payload: usize,
    sequence_number: u16,
    last_ticks: u64,
}

impl Packetizer {
    /// VP8 packetizer with a random SSRC (unless configured) and a random
    /// initial sequence number.
    pub fn new(config: &CaptureConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = rand::thread_rng();
        Ok(Self {
            payloader: Box::<Vp8Payloader>::default(),
            payload_type: config.payload_type,
            ssrc: config.ssrc.unwrap_or_else(|| rng.gen()),
            clock_rate: config.clock_rate,
            max_payload: config.max_packet_size - RTP_HEADER_SIZE,
            sequence_number: rng.gen(),
            last_ticks: 0,
        })
    }

    pub fn with_initial_sequence(mut self, sequence_number: u16) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Sequence number the next packet will carry.
    pub fn next_sequence_number(&self) -> u16 {
        self.sequence_number
    }

    /// Clock-rate ticks for `elapsed`, never lower than the previous call.
    pub fn timestamp_for(&mut self, elapsed: Duration) -> u32 {
        let ticks = elapsed.as_nanos() * u128::from(self.clock_rate) / 1_000_000_000;
        let ticks = u64::try_from(ticks).unwrap_or(u64::MAX);
        self.last_ticks = self.last_ticks.max(ticks);
        // RTP timestamps are 32-bit and wrap
        self.last_ticks as u32
    }

    pub fn packetize(&mut self, frame: &CaptureFrame) -> Result<Vec<Packet>> {
        if frame.payload.is_empty() {
            return Ok(Vec::new());
        }

        let timestamp = self.timestamp_for(frame.elapsed);
        let payloads = self
            .payloader
            .payload(self.max_payload, &frame.payload)
            .map_err(|err| Error::internal(format!("payloader: {}", err)))?;

        let last = payloads.len().saturating_sub(1);
        let packets = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let sequence_number = self.sequence_number;
                self.sequence_number = self.sequence_number.wrapping_add(1);
                Packet {
                    header: Header {
                        version: 2,
                        marker: i == last,
                        payload_type: self.payload_type,
                        sequence_number,
                        timestamp,
                        ssrc: self.ssrc,
                        ..Default::default()
                    },
                    payload,
                }
            })
            .collect();
        Ok(packets)
    }
}
