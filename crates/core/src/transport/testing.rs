//! In-memory endpoints for exercising the session without sockets.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{BufferSizes, Endpoint, EndpointOpener, EndpointParams};
use crate::error::{Result, RxtxError};

/// Shared bookkeeping between a [`MockOpener`] and the endpoints it opened.
#[derive(Default)]
pub struct MockState {
    pub live: AtomicUsize,
    pub opened: AtomicUsize,
    /// Fail the n-th open call (1-based, counted over the opener's lifetime).
    pub fail_on: Mutex<Option<usize>>,
    /// Fail every open whose send port equals this value.
    pub fail_send_port: Mutex<Option<u16>>,
    pub refuse_recv_buffer: AtomicBool,
    pub fail_retarget: AtomicBool,
    /// When set, destination resolution waits on this barrier twice: once on
    /// entry and once before returning.
    pub resolve_gate: Mutex<Option<Arc<Barrier>>>,
    /// Ports of endpoints in open order, for allocation checks.
    pub ports: Mutex<Vec<(u16, u16)>>,
    /// SSRCs of endpoints in drop order.
    pub closed: Mutex<Vec<u32>>,
    /// Packets sent, tagged with the sending endpoint's SSRC.
    pub sent: Mutex<Vec<(u32, Vec<u8>)>>,
    /// Packets waiting to be received, per endpoint SSRC.
    pub inbound: Mutex<HashMap<u32, VecDeque<Vec<u8>>>>,
    /// SSRCs of endpoints that had weak validation enabled.
    pub weak: Mutex<Vec<u32>>,
    pub tools: Mutex<Vec<(u32, String)>>,
    next_ssrc: AtomicU32,
}

#[derive(Clone, Default)]
pub struct MockOpener {
    pub state: Arc<MockState>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(n: usize) -> Self {
        let opener = Self::new();
        *opener.state.fail_on.lock() = Some(n);
        opener
    }

    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Queue a packet for the endpoint with `ssrc` to receive.
    pub fn deliver(&self, ssrc: u32, packet: Vec<u8>) {
        self.state
            .inbound
            .lock()
            .entry(ssrc)
            .or_default()
            .push_back(packet);
    }
}

impl EndpointOpener for MockOpener {
    fn open(&self, params: &EndpointParams<'_>) -> Result<Box<dyn Endpoint>> {
        let call = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
        if *self.state.fail_on.lock() == Some(call)
            || *self.state.fail_send_port.lock() == Some(params.send_port)
        {
            return Err(RxtxError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "injected open failure",
            )));
        }

        self.state
            .ports
            .lock()
            .push((params.recv_port, params.send_port));
        self.state.live.fetch_add(1, Ordering::SeqCst);
        let ssrc = 0x1000 + self.state.next_ssrc.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MockEndpoint {
            state: self.state.clone(),
            destination: Mutex::new(params.destination.to_string()),
            recv_port: params.recv_port,
            send_port: params.send_port,
            ssrc,
        }))
    }
}

pub struct MockEndpoint {
    state: Arc<MockState>,
    destination: Mutex<String>,
    recv_port: u16,
    send_port: u16,
    ssrc: u32,
}

impl Endpoint for MockEndpoint {
    fn destination(&self) -> String {
        self.destination.lock().clone()
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
        if enabled {
            self.state.weak.lock().push(self.ssrc);
        }
    }

    fn set_tool(&self, tool: &str) {
        self.state.tools.lock().push((self.ssrc, tool.to_string()));
    }

    fn set_recv_buffer(&self, _bytes: usize) -> bool {
        !self.state.refuse_recv_buffer.load(Ordering::SeqCst)
    }

    fn set_send_buffer(&self, _bytes: usize) -> bool {
        true
    }

    fn buffer_sizes(&self) -> BufferSizes {
        BufferSizes::default()
    }

    fn resolve_destination(&self, destination: &str) -> Result<IpAddr> {
        let gate = self.state.resolve_gate.lock().clone();
        if let Some(gate) = &gate {
            gate.wait();
        }
        let resolved = if self.state.fail_retarget.load(Ordering::SeqCst) {
            Err(RxtxError::DestinationUnresolved(destination.to_string()))
        } else {
            Ok(destination
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        };
        if let Some(gate) = &gate {
            gate.wait();
        }
        resolved
    }

    fn change_destination(&self, destination: &str, _ip: IpAddr) -> Result<()> {
        *self.destination.lock() = destination.to_string();
        Ok(())
    }

    fn send(&self, packet: &[u8]) -> Result<usize> {
        self.state.sent.lock().push((self.ssrc, packet.to_vec()));
        Ok(packet.len())
    }

    fn try_recv(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut inbound = self.state.inbound.lock();
        let queue = inbound.entry(self.ssrc).or_default();
        Ok(queue.pop_front().map(|pkt| {
            let n = pkt.len().min(buf.len());
            buf[..n].copy_from_slice(&pkt[..n]);
            n
        }))
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        self.state.closed.lock().push(self.ssrc);
    }
}
