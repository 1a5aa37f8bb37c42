//! Transport endpoint primitive.
//!
//! An [`Endpoint`] is one opened RTP binding: it receives on a local port and
//! sends to a single destination address and port. Endpoints are created by
//! an [`EndpointOpener`] so the session can be driven by real sockets
//! ([`udp::UdpOpener`]) or by an in-memory opener in tests.
//!
//! Closing an endpoint is dropping it. The last owner releases the socket.

pub mod udp;

#[cfg(test)]
pub mod testing;

use std::net::IpAddr;

use crate::config::AddressFamily;
use crate::error::Result;

pub use udp::{UdpEndpoint, UdpOpener};

/// Parameters for opening one endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParams<'a> {
    /// Destination host (name or literal address, no port).
    pub destination: &'a str,
    pub multicast_if: Option<&'a str>,
    pub recv_port: u16,
    pub send_port: u16,
    pub family: AddressFamily,
    pub ttl: u32,
}

/// Socket buffer sizes as reported by the OS after negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferSizes {
    pub recv: usize,
    pub send: usize,
}

/// One opened transport endpoint.
///
/// All methods take `&self`: the endpoint set hands out shared references to
/// the send path, so mutable state lives behind interior locks.
pub trait Endpoint: Send + Sync {
    /// Current destination host.
    fn destination(&self) -> String;

    fn recv_port(&self) -> u16;

    fn send_port(&self) -> u16;

    /// Locally generated synchronization source identifier.
    fn ssrc(&self) -> u32;

    /// Accept inbound packets from any source instead of only the destination.
    fn set_weak_validation(&self, enabled: bool);

    /// Attach the tool descriptor advertised to remote participants.
    ///
    /// No RTCP is emitted by this crate, so implementations only need to
    /// record it.
    fn set_tool(&self, tool: &str);

    /// Try to raise the receive buffer. Returns `false` if the OS capped it
    /// below the requested size.
    fn set_recv_buffer(&self, bytes: usize) -> bool;

    /// Try to raise the send buffer. Returns `false` if the OS capped it.
    fn set_send_buffer(&self, bytes: usize) -> bool;

    fn buffer_sizes(&self) -> BufferSizes;

    /// Resolve `destination` to an address of this endpoint's family.
    ///
    /// May block on name resolution; callers keep it outside any lock.
    fn resolve_destination(&self, destination: &str) -> Result<IpAddr>;

    /// Retarget this endpoint to an already resolved destination, keeping
    /// its ports.
    fn change_destination(&self, destination: &str, ip: IpAddr) -> Result<()>;

    /// Send one packet to the destination.
    fn send(&self, packet: &[u8]) -> Result<usize>;

    /// Receive one pending packet without blocking.
    fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>>;
}

/// Factory for endpoints.
pub trait EndpointOpener: Send + Sync {
    fn open(&self, params: &EndpointParams<'_>) -> Result<Box<dyn Endpoint>>;
}
