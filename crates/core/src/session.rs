//! Video transport session.
//!
//! A [`Session`] owns the endpoint set, the participant registry, the FEC
//! encoder, the pause flag and the transmitter of one outgoing video stream.
//! It is shared between two paths:
//!
//! - the **control path** ([`crate::control`]) applies [`ControlMessage`]s one
//!   at a time through [`Session::dispatch`];
//! - the **send path** calls [`Session::send_frame`] for every frame.
//!
//! ## Locking
//!
//! The endpoint set and the registry live together behind one
//! `parking_lot::RwLock`. Reconfigurations take the write side for their
//! whole duration (a send-port change holds it across close-then-reopen), so
//! the send path, which only takes the read side long enough to clone the
//! endpoint handles, sees either the old set or the new one. Packets are sent
//! after the lock is released.
//!
//! The pause flag is an atomic. The FEC encoder has its own mutex.
//! Change-destination resolves the new host before taking the write side, so
//! a slow name lookup never blocks the send path.
//!
//! ## Failure
//!
//! The first session-fatal error is latched. From then on
//! [`Session::send_frame`] returns [`RxtxError::Failed`] and sends nothing.
//!
//! ## Lifecycle
//!
//! ```text
//! open       -> validate config, open endpoints, build transmitter, apply initial FEC
//! dispatch   -> change-destination | change-send-port | pause | play | change-fec
//! drop/close -> transmitter, endpoints, registry, FEC (in that order)
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::config::{RTP_MAX_PACKET_LEN, SessionConfig};
use crate::control::ControlMessage;
use crate::endpoint::{EndpointSet, OpenRequest};
use crate::error::{Result, RxtxError};
use crate::fec::{FecBackend, FecConfig, FecManager, ParityBackend};
use crate::participant::{Participant, ParticipantRegistry};
use crate::transmit::{Transmitter, parse_ssrc, stamp_ssrc};
use crate::transport::{Endpoint, EndpointOpener, UdpOpener};

/// State guarded by the session's endpoint lock.
struct Network {
    endpoints: EndpointSet,
    participants: ParticipantRegistry,
    send_port_base: u16,
}

pub struct Session {
    config: SessionConfig,
    opener: Arc<dyn EndpointOpener>,
    network: RwLock<Network>,
    paused: AtomicBool,
    fec: FecManager,
    transmitter: Mutex<Option<Transmitter>>,
    failure: Mutex<Option<String>>,
}

impl Session {
    /// Open a session on UDP sockets with the parity FEC backend.
    pub fn open(config: SessionConfig) -> Result<Self> {
        Self::open_with(config, Arc::new(UdpOpener), Arc::new(ParityBackend))
    }

    /// Open a session with explicit endpoint and FEC factories.
    ///
    /// Nothing is left open on failure: a bad configuration is rejected
    /// before any endpoint is created, a failing destination rolls back the
    /// ones opened before it, and a failing initial FEC configuration tears
    /// the half-built session down.
    pub fn open_with(
        config: SessionConfig,
        opener: Arc<dyn EndpointOpener>,
        fec_backend: Arc<dyn FecBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let initial_fec = config
            .fec
            .as_deref()
            .map(str::parse::<FecConfig>)
            .transpose()?;

        let mut participants = ParticipantRegistry::new();
        let endpoints = EndpointSet::open(
            opener.as_ref(),
            &open_request(&config, config.send_port_base),
            &mut participants,
        )?;
        let transmitter = Transmitter::new(config.mtu, config.packet_rate)?;

        let session = Self {
            network: RwLock::new(Network {
                endpoints,
                participants,
                send_port_base: config.send_port_base,
            }),
            config,
            opener,
            paused: AtomicBool::new(false),
            fec: FecManager::new(fec_backend),
            transmitter: Mutex::new(Some(transmitter)),
            failure: Mutex::new(None),
        };

        if let Some(fec) = initial_fec {
            session.fec.apply(fec)?;
        }

        tracing::info!(
            destinations = %session.config.destinations,
            endpoints = session.endpoint_count(),
            recv_port = session.config.recv_port_base,
            send_port = session.config.send_port_base,
            mtu = session.config.mtu,
            "session opened"
        );
        Ok(session)
    }

    /// Tear the session down.
    ///
    /// Equivalent to dropping it; provided so the end of a stream reads
    /// explicitly at the call site.
    pub fn close(self) {
        drop(self);
    }

    /// Apply one control message.
    ///
    /// Errors for which [`RxtxError::is_fatal`] holds mean the session can
    /// no longer transmit correctly and must be closed by the caller.
    pub fn dispatch(&self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::ChangeDestination(addr) => self.change_destination(&addr),
            ControlMessage::ChangeSendPort(port) => self.change_send_port(port),
            ControlMessage::Pause => {
                self.set_paused(true);
                Ok(())
            }
            ControlMessage::Play => {
                self.set_paused(false);
                Ok(())
            }
            ControlMessage::ChangeFec(grammar) => self.change_fec(&grammar),
        }
    }

    /// Retarget the single endpoint of this session.
    ///
    /// Rejected with [`RxtxError::NotSingleEndpoint`] unless exactly one
    /// endpoint is open. A failure to resolve or retarget is logged and the
    /// previous destination stays in use.
    pub fn change_destination(&self, destination: &str) -> Result<()> {
        let endpoint = self.single_endpoint()?;
        let ip = match endpoint.resolve_destination(destination) {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(
                    destination,
                    current = %endpoint.destination(),
                    error = %e,
                    "unable to resolve receiver, keeping current destination"
                );
                return Ok(());
            }
        };

        let network = self.network.write();
        let open = network.endpoints.len();
        let endpoint = match network.endpoints.get(0) {
            Some(ep) if open == 1 => ep,
            _ => return Err(RxtxError::NotSingleEndpoint { open }),
        };

        match endpoint.change_destination(destination, ip) {
            Ok(()) => tracing::info!(destination, "receiver changed"),
            Err(e) => tracing::warn!(
                destination,
                current = %endpoint.destination(),
                error = %e,
                "changing receiver failed, keeping current destination"
            ),
        }
        Ok(())
    }

    /// Close every endpoint and reopen them at a new send-port base.
    ///
    /// A base that cannot hold every destination is rejected before anything
    /// is closed. The write lock is held across the whole replacement. If
    /// reopening fails the session is left without endpoints and
    /// [`RxtxError::ReopenFailed`] is returned.
    pub fn change_send_port(&self, port: u16) -> Result<()> {
        open_request(&self.config, port).ports()?;
        let result = self.replace_endpoints(port);
        self.latch(result)
    }

    fn replace_endpoints(&self, port: u16) -> Result<()> {
        let mut guard = self.network.write();
        let network = &mut *guard;

        network.endpoints.close(&mut network.participants);
        network.send_port_base = port;

        match EndpointSet::open(
            self.opener.as_ref(),
            &open_request(&self.config, port),
            &mut network.participants,
        ) {
            Ok(endpoints) => {
                network.endpoints = endpoints;
                tracing::info!(send_port = port, endpoints = network.endpoints.len(), "send port changed");
                Ok(())
            }
            Err(e) => Err(RxtxError::ReopenFailed {
                port,
                source: Box::new(e),
            }),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        let was = self.paused.swap(paused, Ordering::SeqCst);
        if was != paused {
            tracing::info!(paused, "transmission state changed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Replace the FEC encoder. See [`FecManager::reconfigure`].
    pub fn change_fec(&self, grammar: &str) -> Result<()> {
        let result = self.fec.reconfigure(grammar);
        self.latch(result)
    }

    /// Reason of the session-fatal error this session hit, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Record the first session-fatal error of `result`.
    fn latch(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result
            && e.is_fatal()
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                tracing::error!(error = %e, "session failed, transmission stopped");
                *failure = Some(e.to_string());
            }
        }
        result
    }

    fn single_endpoint(&self) -> Result<Arc<dyn Endpoint>> {
        let network = self.network.read();
        let open = network.endpoints.len();
        match network.endpoints.get(0) {
            Some(ep) if open == 1 => Ok(ep.clone()),
            _ => Err(RxtxError::NotSingleEndpoint { open }),
        }
    }

    pub fn fec_config(&self) -> Option<FecConfig> {
        self.fec.current()
    }

    /// Packetize one frame and send it to every endpoint.
    ///
    /// Returns the number of packets handed to the sockets; `0` while paused.
    /// Per-packet send failures are logged and do not abort the frame. Each
    /// endpoint sends under its own SSRC.
    ///
    /// Once the session has failed, nothing is sent and
    /// [`RxtxError::Failed`] is returned.
    pub fn send_frame(&self, frame: &[u8], timestamp_increment: u32) -> Result<usize> {
        if let Some(reason) = self.failure() {
            return Err(RxtxError::Failed { reason });
        }
        if self.is_paused() {
            return Ok(0);
        }

        let (packets, interval) = {
            let mut guard = self.transmitter.lock();
            let Some(tx) = guard.as_mut() else {
                return Ok(0);
            };
            (
                tx.packetize(frame, timestamp_increment, &self.fec)?,
                tx.packet_interval(),
            )
        };

        let endpoints = self.endpoints();
        let mut scratch = Vec::with_capacity(self.config.mtu);
        let mut sent = 0;
        for packet in &packets {
            for endpoint in &endpoints {
                scratch.clear();
                scratch.extend_from_slice(packet);
                stamp_ssrc(&mut scratch, endpoint.ssrc());
                match endpoint.send(&scratch) {
                    Ok(_) => sent += 1,
                    Err(e) => tracing::debug!(
                        destination = %endpoint.destination(),
                        error = %e,
                        "packet send failed"
                    ),
                }
            }
            if let Some(interval) = interval {
                thread::sleep(interval);
            }
        }
        Ok(sent)
    }

    /// Drain pending inbound packets and account their senders.
    ///
    /// Returns the number of RTP packets seen.
    pub fn poll_incoming(&self) -> usize {
        let endpoints = self.endpoints();
        let mut buf = vec![0u8; RTP_MAX_PACKET_LEN];
        let mut seen = Vec::new();

        for endpoint in &endpoints {
            loop {
                match endpoint.try_recv(&mut buf) {
                    Ok(Some(len)) => {
                        if let Some(ssrc) = parse_ssrc(&buf[..len]) {
                            seen.push((ssrc, len));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(destination = %endpoint.destination(), error = %e, "receive failed");
                        break;
                    }
                }
            }
        }

        if !seen.is_empty() {
            let mut network = self.network.write();
            for (ssrc, len) in &seen {
                network.participants.observe(*ssrc, *len);
            }
        }
        seen.len()
    }

    /// Snapshot of the current endpoints, safe to use after the lock is gone.
    pub fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.network.read().endpoints.snapshot()
    }

    pub fn endpoint_count(&self) -> usize {
        self.network.read().endpoints.len()
    }

    /// `(recv_port, send_port)` of every endpoint, in index order.
    pub fn endpoint_ports(&self) -> Vec<(u16, u16)> {
        self.network
            .read()
            .endpoints
            .iter()
            .map(|ep| (ep.recv_port(), ep.send_port()))
            .collect()
    }

    pub fn send_port_base(&self) -> u16 {
        self.network.read().send_port_base
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.network.read().participants.iter().cloned().collect()
    }

    pub fn participant_count(&self) -> usize {
        self.network.read().participants.len()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        drop(self.transmitter.lock().take());

        let network = self.network.get_mut();
        network.endpoints.close(&mut network.participants);
        let residual = network.participants.drain_all();

        self.fec.teardown();
        tracing::info!(
            destinations = %self.config.destinations,
            residual_participants = residual.len(),
            "session closed"
        );
    }
}

fn open_request(config: &SessionConfig, send_port_base: u16) -> OpenRequest<'_> {
    OpenRequest {
        destinations: &config.destinations,
        recv_port_base: config.recv_port_base,
        send_port_base,
        family: config.family,
        multicast_if: config.multicast_if.as_deref(),
        ttl: config.ttl,
    }
}
