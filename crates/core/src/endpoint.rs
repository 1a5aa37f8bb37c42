//! Bulk construction and teardown of the per-destination endpoints.
//!
//! ## Port layout
//!
//! Video destinations are laid out two ports apart from the configured base.
//! The pair directly after the base is reserved for the co-located audio
//! stream and is skipped once:
//!
//! ```text
//! index:  0      1       2       3       k>=2
//! port:   B      B+4     B+6     B+8     B+2+2k
//!              (B+2 reserved for audio)
//! ```
//!
//! Receive and send ports follow the layout independently.

use std::sync::Arc;

use crate::config::{
    AddressFamily, INITIAL_VIDEO_RECV_BUFFER_SIZE, INITIAL_VIDEO_SEND_BUFFER_SIZE, TOOL_DESCRIPTOR,
    parse_destinations,
};
use crate::error::{Result, RxtxError};
use crate::participant::ParticipantRegistry;
use crate::transport::{Endpoint, EndpointOpener, EndpointParams};

/// Port of the endpoint at `index`, relative to `base`.
pub fn port_for_index(base: u16, index: usize) -> Result<u16> {
    let offset = if index == 0 { 0 } else { 2 + 2 * index };
    u16::try_from(base as usize + offset).map_err(|_| RxtxError::PortRangeExhausted)
}

/// What to open: the destination list and where to put it.
#[derive(Debug, Clone)]
pub struct OpenRequest<'a> {
    /// Comma-separated destinations.
    pub destinations: &'a str,
    pub recv_port_base: u16,
    pub send_port_base: u16,
    pub family: AddressFamily,
    pub multicast_if: Option<&'a str>,
    pub ttl: u32,
}

impl OpenRequest<'_> {
    /// `(recv_port, send_port)` for every destination, in index order.
    ///
    /// Fails on an empty destination list or when a port leaves the `u16`
    /// range, without touching any endpoint.
    pub fn ports(&self) -> Result<Vec<(u16, u16)>> {
        (0..parse_destinations(self.destinations)?.len())
            .map(|i| {
                Ok((
                    port_for_index(self.recv_port_base, i)?,
                    port_for_index(self.send_port_base, i)?,
                ))
            })
            .collect()
    }
}

/// Ordered set of opened endpoints, one per destination.
///
/// A set is either fully populated or empty. Index 0 is the endpoint
/// addressed by change-destination.
#[derive(Default)]
pub struct EndpointSet {
    endpoints: Vec<Arc<dyn Endpoint>>,
    capped_recv_buffers: usize,
}

impl EndpointSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Open one endpoint per destination and register their SSRCs.
    ///
    /// Fails without leaving anything behind: if any destination cannot be
    /// opened, every endpoint opened by this call is closed in reverse order
    /// and its registry record removed before the error is returned.
    pub fn open(
        opener: &dyn EndpointOpener,
        request: &OpenRequest<'_>,
        registry: &mut ParticipantRegistry,
    ) -> Result<Self> {
        let destinations = parse_destinations(request.destinations)?;
        let ports = request.ports()?;
        let mut capped_recv_buffers = 0;

        let mut partial = Rollback {
            opened: Vec::with_capacity(destinations.len()),
            registry,
        };

        for (index, (destination, (recv_port, send_port))) in
            destinations.into_iter().zip(ports).enumerate()
        {
            let params = EndpointParams {
                destination,
                multicast_if: request.multicast_if,
                recv_port,
                send_port,
                family: request.family,
                ttl: request.ttl,
            };

            let endpoint: Arc<dyn Endpoint> = match opener.open(&params) {
                Ok(ep) => Arc::from(ep),
                Err(e) => {
                    tracing::warn!(
                        index,
                        destination,
                        recv_port,
                        send_port,
                        error = %e,
                        rolled_back = partial.opened.len(),
                        "endpoint open failed"
                    );
                    return Err(RxtxError::EndpointOpen {
                        index,
                        destination: destination.to_string(),
                        source: Box::new(e),
                    });
                }
            };

            endpoint.set_weak_validation(true);
            endpoint.set_tool(TOOL_DESCRIPTOR);
            if !endpoint.set_recv_buffer(INITIAL_VIDEO_RECV_BUFFER_SIZE) {
                capped_recv_buffers += 1;
                tracing::warn!("{}", buffer_increase_hint(INITIAL_VIDEO_RECV_BUFFER_SIZE));
            }
            if !endpoint.set_send_buffer(INITIAL_VIDEO_SEND_BUFFER_SIZE) {
                tracing::debug!(index, size = INITIAL_VIDEO_SEND_BUFFER_SIZE, "send buffer not raised");
            }

            partial.registry.add(endpoint.ssrc());
            tracing::debug!(
                index,
                destination,
                recv_port,
                send_port,
                ssrc = format_args!("{:#010X}", endpoint.ssrc()),
                buffers = ?endpoint.buffer_sizes(),
                "endpoint opened"
            );
            partial.opened.push(endpoint);
        }

        Ok(Self {
            endpoints: partial.commit(),
            capped_recv_buffers,
        })
    }

    /// Close every endpoint in order and drop their registry records.
    ///
    /// Closing an empty set does nothing.
    pub fn close(&mut self, registry: &mut ParticipantRegistry) {
        if self.endpoints.is_empty() {
            return;
        }
        let count = self.endpoints.len();
        for endpoint in self.endpoints.drain(..) {
            registry.remove(endpoint.ssrc());
        }
        self.capped_recv_buffers = 0;
        tracing::debug!(count, "endpoint set closed");
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints whose receive buffer the OS kept below the requested size.
    pub fn capped_recv_buffers(&self) -> usize {
        self.capped_recv_buffers
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Endpoint>> {
        self.endpoints.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Endpoint>> {
        self.endpoints.iter()
    }

    /// Clone the endpoint handles so they can be used after the lock guarding
    /// this set is released.
    pub fn snapshot(&self) -> Vec<Arc<dyn Endpoint>> {
        self.endpoints.clone()
    }
}

/// Endpoints opened so far in one [`EndpointSet::open`] call.
///
/// Dropped without [`commit`](Self::commit), it closes them newest first and
/// removes their registry records.
struct Rollback<'r> {
    opened: Vec<Arc<dyn Endpoint>>,
    registry: &'r mut ParticipantRegistry,
}

impl Rollback<'_> {
    fn commit(mut self) -> Vec<Arc<dyn Endpoint>> {
        std::mem::take(&mut self.opened)
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        while let Some(endpoint) = self.opened.pop() {
            self.registry.remove(endpoint.ssrc());
        }
    }
}

/// How to let the kernel grant the receive buffer we asked for.
fn buffer_increase_hint(size: usize) -> String {
    let tuning = if cfg!(target_os = "macos") {
        format!(
            "\tsysctl -w kern.ipc.maxsockbuf={}\n\tsysctl -w net.inet.udp.recvspace={}",
            size * 4,
            size
        )
    } else {
        format!("\tsysctl -w net.core.rmem_max={size}")
    };
    format!(
        "\n***\nUnable to set receive buffer size to {size} B.\n\
         Please set net.core.rmem_max value to {size} or greater:\n{tuning}\n\
         To make this persistent, add these options (key=value) to /etc/sysctl.conf\n***"
    )
}
