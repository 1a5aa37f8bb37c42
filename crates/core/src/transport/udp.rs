use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use rand::RngExt;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use super::{BufferSizes, Endpoint, EndpointOpener, EndpointParams};
use crate::config::AddressFamily;
use crate::error::{Result, RxtxError};

/// UDP endpoint for RTP video.
///
/// Binds the receive port on the wildcard address of the requested family
/// and sends every packet to `destination:send_port`. Multicast destinations
/// are joined on the receive socket so the group traffic is received too.
///
/// RTCP is not emitted; the tool descriptor only appears in the logs.
pub struct UdpEndpoint {
    socket: UdpSocket,
    family: AddressFamily,
    multicast_if: Option<String>,
    ttl: u32,
    recv_port: u16,
    send_port: u16,
    ssrc: u32,
    target: RwLock<Target>,
    weak_validation: AtomicBool,
}

#[derive(Debug, Clone)]
struct Target {
    host: String,
    addr: SocketAddr,
}

impl UdpEndpoint {
    pub fn open(params: &EndpointParams<'_>) -> Result<Self> {
        let addr = resolve(params.destination, params.send_port, params.family)?;

        let domain = match params.family {
            AddressFamily::V4 => Domain::IPV4,
            AddressFamily::V6 => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;

        let bind_addr = match params.family {
            AddressFamily::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), params.recv_port),
            AddressFamily::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), params.recv_port),
        };
        socket.bind(&bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket: UdpSocket = socket.into();
        configure_target(&socket, addr, params.multicast_if, params.ttl)?;

        let ssrc = rand::rng().random::<u32>();
        tracing::debug!(
            destination = params.destination,
            %addr,
            recv_port = params.recv_port,
            ssrc = format_args!("{:#010X}", ssrc),
            "UDP endpoint bound"
        );

        Ok(Self {
            socket,
            family: params.family,
            multicast_if: params.multicast_if.map(str::to_string),
            ttl: params.ttl,
            recv_port: params.recv_port,
            send_port: params.send_port,
            ssrc,
            target: RwLock::new(Target {
                host: params.destination.to_string(),
                addr,
            }),
            weak_validation: AtomicBool::new(false),
        })
    }

    /// Local address the receive socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Resolved destination socket address.
    pub fn destination_addr(&self) -> SocketAddr {
        self.target.read().addr
    }
}

impl Endpoint for UdpEndpoint {
    fn destination(&self) -> String {
        self.target.read().host.clone()
    }

    fn recv_port(&self) -> u16 {
        self.recv_port
    }

    fn send_port(&self) -> u16 {
        self.send_port
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn set_weak_validation(&self, enabled: bool) {
        self.weak_validation.store(enabled, Ordering::Relaxed);
    }

    fn set_tool(&self, tool: &str) {
        tracing::trace!(ssrc = format_args!("{:#010X}", self.ssrc), tool, "tool descriptor attached");
    }

    fn set_recv_buffer(&self, bytes: usize) -> bool {
        let sock = SockRef::from(&self.socket);
        if sock.set_recv_buffer_size(bytes).is_err() {
            return false;
        }
        // Linux reports twice the requested size for bookkeeping overhead.
        sock.recv_buffer_size().map(|n| n >= bytes).unwrap_or(false)
    }

    fn set_send_buffer(&self, bytes: usize) -> bool {
        let sock = SockRef::from(&self.socket);
        if sock.set_send_buffer_size(bytes).is_err() {
            return false;
        }
        sock.send_buffer_size().map(|n| n >= bytes).unwrap_or(false)
    }

    fn buffer_sizes(&self) -> BufferSizes {
        let sock = SockRef::from(&self.socket);
        BufferSizes {
            recv: sock.recv_buffer_size().unwrap_or(0),
            send: sock.send_buffer_size().unwrap_or(0),
        }
    }

    fn resolve_destination(&self, destination: &str) -> Result<IpAddr> {
        Ok(resolve(destination, self.send_port, self.family)?.ip())
    }

    fn change_destination(&self, destination: &str, ip: IpAddr) -> Result<()> {
        let addr = SocketAddr::new(ip, self.send_port);
        configure_target(&self.socket, addr, self.multicast_if.as_deref(), self.ttl)?;

        let mut target = self.target.write();
        tracing::debug!(old = %target.addr, new = %addr, "UDP endpoint retargeted");
        *target = Target {
            host: destination.to_string(),
            addr,
        };
        Ok(())
    }

    fn send(&self, packet: &[u8]) -> Result<usize> {
        let addr = self.target.read().addr;
        Ok(self.socket.send_to(packet, addr)?)
    }

    fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, from)) => {
                    if self.weak_validation.load(Ordering::Relaxed)
                        || from.ip() == self.target.read().addr.ip()
                    {
                        return Ok(Some(len));
                    }
                    tracing::trace!(%from, "dropping packet from unexpected source");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Opens [`UdpEndpoint`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpOpener;

impl EndpointOpener for UdpOpener {
    fn open(&self, params: &EndpointParams<'_>) -> Result<Box<dyn Endpoint>> {
        Ok(Box::new(UdpEndpoint::open(params)?))
    }
}

/// Resolve `host` with `port`, keeping only addresses of `family`.
fn resolve(host: &str, port: u16, family: AddressFamily) -> Result<SocketAddr> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    (bare, port)
        .to_socket_addrs()?
        .find(|addr| match family {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        })
        .ok_or_else(|| RxtxError::DestinationUnresolved(host.to_string()))
}

/// Apply TTL and multicast settings for sending to `addr`.
fn configure_target(
    socket: &UdpSocket,
    addr: SocketAddr,
    multicast_if: Option<&str>,
    ttl: u32,
) -> Result<()> {
    let sock = SockRef::from(socket);
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_multicast() => {
            let iface = match multicast_if {
                Some(hint) => hint.parse::<Ipv4Addr>().unwrap_or_else(|_| {
                    tracing::warn!(hint, "multicast interface is not an IPv4 address, using default");
                    Ipv4Addr::UNSPECIFIED
                }),
                None => Ipv4Addr::UNSPECIFIED,
            };
            sock.set_multicast_if_v4(&iface)?;
            sock.set_multicast_ttl_v4(ttl)?;
            join_or_ignore(sock.join_multicast_v4(&ip, &iface), addr);
        }
        IpAddr::V4(_) => sock.set_ttl(ttl)?,
        IpAddr::V6(ip) if ip.is_multicast() => {
            let index = match multicast_if {
                Some(hint) => hint.parse::<u32>().unwrap_or_else(|_| {
                    tracing::warn!(hint, "multicast interface is not an interface index, using default");
                    0
                }),
                None => 0,
            };
            sock.set_multicast_if_v6(index)?;
            sock.set_multicast_hops_v6(ttl)?;
            join_or_ignore(sock.join_multicast_v6(&ip, index), addr);
        }
        IpAddr::V6(_) => sock.set_unicast_hops_v6(ttl)?,
    }
    Ok(())
}

fn join_or_ignore(result: io::Result<()>, group: SocketAddr) {
    match result {
        Ok(()) => tracing::debug!(%group, "joined multicast group"),
        // Rejoining after a retarget to the same group.
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {}
        Err(e) => tracing::warn!(%group, error = %e, "unable to join multicast group"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(recv_port: u16, send_port: u16) -> EndpointParams<'static> {
        EndpointParams {
            destination: "127.0.0.1",
            multicast_if: None,
            recv_port,
            send_port,
            family: AddressFamily::V4,
            ttl: 255,
        }
    }

    #[test]
    fn resolve_literal_v4() {
        let addr = resolve("127.0.0.1", 5004, AddressFamily::V4).unwrap();
        assert_eq!(addr, "127.0.0.1:5004".parse().unwrap());
    }

    #[test]
    fn resolve_wrong_family() {
        assert!(matches!(
            resolve("127.0.0.1", 5004, AddressFamily::V6),
            Err(RxtxError::DestinationUnresolved(_))
        ));
    }

    #[test]
    fn open_binds_receive_port() {
        let ep = UdpEndpoint::open(&params(46100, 46102)).unwrap();
        assert_eq!(ep.local_addr().unwrap().port(), 46100);
        assert_eq!(ep.destination_addr().port(), 46102);
        assert_eq!(ep.destination(), "127.0.0.1");
    }

    #[test]
    fn loopback_send_and_receive() {
        // Send to our own receive port.
        let ep = UdpEndpoint::open(&params(46110, 46110)).unwrap();
        ep.send(b"hello").unwrap();

        let mut buf = [0u8; 64];
        let mut got = None;
        for _ in 0..100 {
            if let Some(n) = ep.try_recv(&mut buf).unwrap() {
                got = Some(n);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(got, Some(5));
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn change_destination_keeps_ports() {
        let ep = UdpEndpoint::open(&params(46120, 46122)).unwrap();
        let ip = ep.resolve_destination("localhost").unwrap();
        assert!(ip.is_ipv4());

        ep.change_destination("localhost", ip).unwrap();
        assert_eq!(ep.destination(), "localhost");
        assert_eq!(ep.destination_addr(), SocketAddr::new(ip, 46122));
        assert_eq!(ep.recv_port(), 46120);
    }

    #[test]
    fn resolve_destination_respects_family() {
        let ep = UdpEndpoint::open(&params(46124, 46126)).unwrap();
        assert!(matches!(
            ep.resolve_destination("::1"),
            Err(RxtxError::DestinationUnresolved(_))
        ));
        assert_eq!(ep.destination(), "127.0.0.1");
    }

    #[test]
    fn unicast_ttl_applied() {
        let ep = UdpEndpoint::open(&EndpointParams {
            ttl: 64,
            ..params(46130, 46132)
        })
        .unwrap();
        assert_eq!(SockRef::from(&ep.socket).ttl().unwrap(), 64);
    }

    #[test]
    fn multicast_destination_configures_group() {
        let ep = UdpEndpoint::open(&EndpointParams {
            destination: "239.255.42.1",
            ttl: 16,
            ..params(46140, 46142)
        })
        .unwrap();

        assert!(ep.destination_addr().ip().is_multicast());
        assert_eq!(ep.destination_addr().port(), 46142);
        assert_eq!(SockRef::from(&ep.socket).multicast_ttl_v4().unwrap(), 16);
    }

    #[test]
    fn multicast_interface_hint_falls_back_to_default() {
        let ep = UdpEndpoint::open(&EndpointParams {
            destination: "239.255.42.2",
            multicast_if: Some("eth-not-an-address"),
            ttl: 8,
            ..params(46150, 46152)
        })
        .unwrap();
        assert_eq!(SockRef::from(&ep.socket).multicast_ttl_v4().unwrap(), 8);
    }

    #[test]
    fn retarget_to_multicast_group() {
        let ep = UdpEndpoint::open(&EndpointParams {
            ttl: 4,
            ..params(46160, 46162)
        })
        .unwrap();
        let ip = ep.resolve_destination("239.255.42.3").unwrap();
        ep.change_destination("239.255.42.3", ip).unwrap();

        assert_eq!(ep.destination_addr(), "239.255.42.3:46162".parse().unwrap());
        assert_eq!(SockRef::from(&ep.socket).multicast_ttl_v4().unwrap(), 4);
    }
}
