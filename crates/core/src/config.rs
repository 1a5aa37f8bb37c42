use crate::error::{ConfigErrorKind, Result, RxtxError};

/// Largest RTP packet the transmitter will produce.
pub const RTP_MAX_PACKET_LEN: usize = 9000;

/// Fixed RTP header size (RFC 3550 §5.1, no CSRCs or extensions).
pub const RTP_HEADER_LEN: usize = 12;

/// Receive buffer size requested for every video endpoint.
///
/// Sized to hold a full uncompressed-ish 1080p frame plus 10% slack.
pub const INITIAL_VIDEO_RECV_BUFFER_SIZE: usize = (4 * 1920 * 1080) * 110 / 100;

/// Send buffer size requested for every video endpoint.
pub const INITIAL_VIDEO_SEND_BUFFER_SIZE: usize = 1024 * 1024;

pub const DEFAULT_PORT_BASE: u16 = 5004;
pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_TTL: u32 = 255;

/// Tool descriptor attached to every endpoint (RTCP SDES TOOL item).
pub const TOOL_DESCRIPTOR: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

/// IP family used for both binding and destination resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    V4,
    V6,
}

impl AddressFamily {
    pub fn from_ipv6_flag(use_ipv6: bool) -> Self {
        if use_ipv6 { Self::V6 } else { Self::V4 }
    }
}

/// Session configuration captured at construction.
///
/// Everything needed to rebuild the endpoint set on reconfiguration is kept
/// here; the send-port base is the only field that changes afterwards and it
/// is tracked by the session itself.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Comma-separated destination list (`host[,host...]`).
    pub destinations: String,
    /// Receive port of the first endpoint.
    pub recv_port_base: u16,
    /// Send port of the first endpoint.
    pub send_port_base: u16,
    pub family: AddressFamily,
    /// Interface hint for multicast destinations (name or address).
    pub multicast_if: Option<String>,
    /// Maximum size of one outgoing packet, RTP header included.
    pub mtu: usize,
    /// Initial FEC configuration in the change-fec grammar.
    pub fec: Option<String>,
    /// Outgoing packets per second; `0` disables pacing.
    pub packet_rate: u64,
    pub ttl: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            destinations: "localhost".to_string(),
            recv_port_base: DEFAULT_PORT_BASE,
            send_port_base: DEFAULT_PORT_BASE,
            family: AddressFamily::V4,
            multicast_if: None,
            mtu: DEFAULT_MTU,
            fec: None,
            packet_rate: 0,
            ttl: DEFAULT_TTL,
        }
    }
}

impl SessionConfig {
    pub fn new(destinations: &str) -> Self {
        Self {
            destinations: destinations.to_string(),
            ..Self::default()
        }
    }

    /// Check the parts of the configuration that can be rejected before any
    /// socket is opened.
    pub fn validate(&self) -> Result<()> {
        if self.mtu > RTP_MAX_PACKET_LEN || self.mtu <= RTP_HEADER_LEN {
            return Err(RxtxError::config(ConfigErrorKind::MtuOutOfRange {
                requested: self.mtu,
                max: RTP_MAX_PACKET_LEN,
            }));
        }
        parse_destinations(&self.destinations)?;
        Ok(())
    }
}

/// Split a comma-separated destination list.
///
/// Empty items are skipped, so `"a,,b"` yields two destinations. A list with
/// no items at all is a configuration error.
pub fn parse_destinations(list: &str) -> Result<Vec<&str>> {
    let destinations: Vec<&str> = list
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();

    if destinations.is_empty() {
        return Err(RxtxError::config(ConfigErrorKind::EmptyDestinationList));
    }
    Ok(destinations)
}
