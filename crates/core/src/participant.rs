//! Participant database keyed by RTP synchronization source.
//!
//! Every opened endpoint registers its own SSRC here. Inbound traffic adds a
//! record for each remote sender seen on any endpoint. The registry is not
//! synchronized on its own: the session keeps it under the same lock as the
//! endpoint set, so both always change together.

use std::collections::HashMap;
use std::time::Instant;

/// Bookkeeping for one synchronization source.
#[derive(Debug, Clone)]
pub struct Participant {
    pub ssrc: u32,
    /// `true` for SSRCs generated by our own endpoints.
    pub local: bool,
    pub packets: u64,
    pub bytes: u64,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl Participant {
    fn new(ssrc: u32, local: bool) -> Self {
        let now = Instant::now();
        Self {
            ssrc,
            local,
            packets: 0,
            bytes: 0,
            first_seen: now,
            last_seen: now,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: HashMap<u32, Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the SSRC of a local endpoint.
    ///
    /// Endpoint SSRCs are generated fresh per endpoint; a clash with an
    /// existing record replaces it.
    pub fn add(&mut self, ssrc: u32) {
        if self
            .participants
            .insert(ssrc, Participant::new(ssrc, true))
            .is_some()
        {
            tracing::warn!(ssrc = format_args!("{:#010X}", ssrc), "SSRC collision, record replaced");
        }
        tracing::trace!(
            ssrc = format_args!("{:#010X}", ssrc),
            total = self.participants.len(),
            "participant added"
        );
    }

    /// Account one inbound packet from `ssrc`, creating its record on first sight.
    pub fn observe(&mut self, ssrc: u32, bytes: usize) {
        let entry = self.participants.entry(ssrc).or_insert_with(|| {
            tracing::debug!(ssrc = format_args!("{:#010X}", ssrc), "new remote participant");
            Participant::new(ssrc, false)
        });
        entry.packets += 1;
        entry.bytes += bytes as u64;
        entry.last_seen = Instant::now();
    }

    pub fn remove(&mut self, ssrc: u32) -> Option<Participant> {
        self.participants.remove(&ssrc)
    }

    /// Remove and return every record.
    pub fn drain_all(&mut self) -> Vec<Participant> {
        let drained: Vec<Participant> = self.participants.drain().map(|(_, p)| p).collect();
        if !drained.is_empty() {
            tracing::debug!(removed = drained.len(), "participant registry drained");
        }
        drained
    }

    pub fn get(&self, ssrc: u32) -> Option<&Participant> {
        self.participants.get(&ssrc)
    }

    pub fn contains(&self, ssrc: u32) -> bool {
        self.participants.contains_key(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }
}
