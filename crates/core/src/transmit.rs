//! Video transmitter: frame → RTP packets.
//!
//! The transmitter owns the outgoing RTP header state and turns one encoded
//! frame into MTU-sized packets. When an FEC encoder is live, parity packets
//! computed over the frame's data payloads follow the data packets under a
//! separate payload type.
//!
//! Packets leave [`Transmitter::packetize`] with a zero SSRC. Each endpoint
//! sends under its own identifier, stamped with [`stamp_ssrc`] at send time,
//! so the SSRC on the wire is the one recorded in the participant registry.

use std::time::Duration;

use crate::config::{RTP_HEADER_LEN, RTP_MAX_PACKET_LEN};
use crate::error::{ConfigErrorKind, Result, RxtxError};
use crate::fec::FecManager;

/// Payload type of video data packets.
pub const PT_VIDEO: u8 = 20;
/// Payload type of FEC parity packets protecting video.
pub const PT_VIDEO_FEC: u8 = 22;

/// Generic RTP fixed header builder (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// Version is always 2. Padding, extension, and CSRC count are always 0.
/// The payload type is chosen per packet so data and parity share one
/// sequence space.
#[derive(Debug)]
pub struct RtpHeader {
    pub ssrc: u32,
    sequence: u16,
    timestamp: u64,
}

impl RtpHeader {
    pub fn new(ssrc: u32) -> Self {
        tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "RTP header state created");
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Serialize a 12-byte RTP fixed header and advance the sequence number.
    pub fn write(&mut self, pt: u8, marker: bool) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = 2 << 6;
        header[1] = ((marker as u8) << 7) | (pt & 0x7f);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&(self.timestamp as u32).to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        header
    }

    pub fn advance_timestamp(&mut self, increment: u32) {
        self.timestamp = self.timestamp.wrapping_add(increment as u64);
    }
}

/// Overwrite the SSRC field of a serialized RTP packet.
pub fn stamp_ssrc(packet: &mut [u8], ssrc: u32) {
    if packet.len() >= RTP_HEADER_LEN {
        packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }
}

/// SSRC of an inbound RTP packet, if it carries a version-2 header.
pub fn parse_ssrc(packet: &[u8]) -> Option<u32> {
    if packet.len() < RTP_HEADER_LEN || packet[0] >> 6 != 2 {
        return None;
    }
    Some(u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]))
}

/// Packetizer and pacer for the video stream of one session.
#[derive(Debug)]
pub struct Transmitter {
    header: RtpHeader,
    mtu: usize,
    packet_interval: Option<Duration>,
}

impl Transmitter {
    /// `packet_rate` is in packets per second; `0` sends as fast as possible.
    pub fn new(mtu: usize, packet_rate: u64) -> Result<Self> {
        if mtu > RTP_MAX_PACKET_LEN || mtu <= RTP_HEADER_LEN {
            return Err(RxtxError::config(ConfigErrorKind::MtuOutOfRange {
                requested: mtu,
                max: RTP_MAX_PACKET_LEN,
            }));
        }
        let packet_interval =
            (packet_rate > 0).then(|| Duration::from_nanos(1_000_000_000 / packet_rate));
        tracing::debug!(mtu, packet_rate, "transmitter initialized");
        Ok(Self {
            header: RtpHeader::new(0),
            mtu,
            packet_interval,
        })
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Delay to keep between two packets, if pacing is enabled.
    pub fn packet_interval(&self) -> Option<Duration> {
        self.packet_interval
    }

    /// Split `frame` into RTP packets and append FEC parity from `fec`.
    ///
    /// All packets of a frame share one timestamp; the marker bit is set on
    /// the last data packet. The timestamp advances by `timestamp_increment`
    /// afterwards. Fails without consuming a sequence number if `fec` is
    /// left without a usable encoder.
    pub fn packetize(
        &mut self,
        frame: &[u8],
        timestamp_increment: u32,
        fec: &FecManager,
    ) -> Result<Vec<Vec<u8>>> {
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let chunks: Vec<Vec<u8>> = frame
            .chunks(self.mtu - RTP_HEADER_LEN)
            .map(<[u8]>::to_vec)
            .collect();
        let parity = fec.with_encoder(|e| e.encode(&chunks))?.unwrap_or_default();

        let last = chunks.len() - 1;
        let mut packets = Vec::with_capacity(chunks.len() + parity.len());
        for (i, chunk) in chunks.iter().enumerate() {
            packets.push(self.finish(PT_VIDEO, i == last, chunk));
        }
        for chunk in &parity {
            packets.push(self.finish(PT_VIDEO_FEC, false, chunk));
        }

        tracing::trace!(
            bytes = frame.len(),
            data = chunks.len(),
            parity = parity.len(),
            "frame packetized"
        );
        self.header.advance_timestamp(timestamp_increment);
        Ok(packets)
    }

    fn finish(&mut self, pt: u8, marker: bool, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + payload.len());
        packet.extend_from_slice(&self.header.write(pt, marker));
        packet.extend_from_slice(payload);
        packet
    }
}
