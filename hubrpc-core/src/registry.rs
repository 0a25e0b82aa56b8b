//! Hub-side peer registry: logical id -> record, envelope -> logical id, liveness.

use std::collections::{HashMap, HashSet};

use crate::identity::{CallId, EnvelopeId, LogicalId};

/// What the hub knows about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub logical_id: LogicalId,
    /// Connection replies are routed to. Replaced when the peer says hello on a new connection.
    pub envelope: EnvelopeId,
    /// Hub clock (ms) of the last frame from this peer.
    pub last_seen: u64,
    /// Silence longer than this (ms) removes the peer.
    pub alive_timeout_ms: u64,
    /// Calls admitted and still being handled.
    pub in_flight: HashSet<CallId>,
    pub total_calls: u64,
    pub hello_count: u64,
}

/// All peers of one hub.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<LogicalId, PeerRecord>,
    envelopes: HashMap<EnvelopeId, LogicalId>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hello. Returns true when the logical id was not mapped before.
    pub fn upsert_hello(
        &mut self,
        logical_id: &LogicalId,
        envelope: EnvelopeId,
        alive_timeout_ms: u64,
        now: u64,
    ) -> bool {
        let is_new = !self.peers.contains_key(logical_id);
        let record = self
            .peers
            .entry(logical_id.clone())
            .or_insert_with(|| PeerRecord {
                logical_id: logical_id.clone(),
                envelope,
                last_seen: now,
                alive_timeout_ms,
                in_flight: HashSet::new(),
                total_calls: 0,
                hello_count: 0,
            });
        if record.envelope != envelope {
            // Only drop the old index if it still points at this peer.
            if self.envelopes.get(&record.envelope) == Some(logical_id) {
                self.envelopes.remove(&record.envelope);
            }
            record.envelope = envelope;
        }
        record.last_seen = now;
        record.alive_timeout_ms = alive_timeout_ms;
        record.hello_count += 1;
        self.envelopes.insert(envelope, logical_id.clone());
        is_new
    }

    /// Update last-seen for the peer behind `envelope`. Returns its logical id if known.
    pub fn touch(&mut self, envelope: EnvelopeId, now: u64) -> Option<LogicalId> {
        let logical = self.envelopes.get(&envelope)?;
        let record = self.peers.get_mut(logical)?;
        record.last_seen = now;
        Some(logical.clone())
    }

    pub fn get(&self, logical_id: &LogicalId) -> Option<&PeerRecord> {
        self.peers.get(logical_id)
    }

    pub fn get_mut(&mut self, logical_id: &LogicalId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(logical_id)
    }

    /// Live envelope for a logical id.
    pub fn envelope_of(&self, logical_id: &LogicalId) -> Option<EnvelopeId> {
        self.peers.get(logical_id).map(|r| r.envelope)
    }

    pub fn remove(&mut self, logical_id: &LogicalId) -> Option<PeerRecord> {
        let record = self.peers.remove(logical_id)?;
        if self.envelopes.get(&record.envelope) == Some(logical_id) {
            self.envelopes.remove(&record.envelope);
        }
        Some(record)
    }

    /// Peers silent for longer than their own alive timeout.
    pub fn expired(&self, now: u64) -> Vec<LogicalId> {
        let mut out: Vec<LogicalId> = self
            .peers
            .values()
            .filter(|r| now.saturating_sub(r.last_seen) > r.alive_timeout_ms)
            .map(|r| r.logical_id.clone())
            .collect();
        out.sort();
        out
    }

    pub fn ids(&self) -> Vec<LogicalId> {
        let mut ids: Vec<LogicalId> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
