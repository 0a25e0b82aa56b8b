//! Hub state machine. The host feeds it frames and ticks; it returns actions.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{secs_to_ms, HubConfig};
use crate::correlation::CorrelationTable;
use crate::identity::{new_generation, CallId, EnvelopeId, HubSessionId, LogicalId};
use crate::protocol::{Message, RemoteError};
use crate::registry::{PeerRecord, PeerRegistry};

/// Something the host must do after feeding the hub an event.
#[derive(Debug)]
pub enum HubAction<W> {
    /// Write a frame to a connection.
    Send(EnvelopeId, Message),
    /// Run the application handler for an admitted call.
    Dispatch {
        peer: LogicalId,
        envelope: EnvelopeId,
        id: CallId,
        method: String,
        params: Value,
    },
    /// A logical id said hello and was not mapped before.
    PeerConnected(LogicalId),
    /// A peer said goodbye (`timed_out == false`) or went silent past its alive timeout.
    PeerClosed { peer: LogicalId, timed_out: bool },
    Ping(LogicalId),
    Event { peer: LogicalId, body: Value },
    /// A hub-initiated call finished.
    Complete {
        waiter: W,
        outcome: Result<Value, RemoteError>,
    },
}

/// Counters since the hub started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub hellos: u64,
    pub pings: u64,
    pub requests: u64,
    pub responses: u64,
    pub retries: u64,
    pub duplicates: u64,
    pub timeouts: u64,
}

/// A hub-initiated call ready to be written.
#[derive(Debug)]
pub struct OutboundCall {
    pub id: CallId,
    pub envelope: EnvelopeId,
    pub frame: Message,
}

/// Hub protocol core: peer registry, admission control, hub-initiated calls.
pub struct HubCore<W> {
    session: HubSessionId,
    registry: PeerRegistry,
    pending: CorrelationTable<W>,
    requests_limit: usize,
    default_alive_timeout_ms: u64,
    stats: HubStats,
    closed: bool,
}

impl<W> HubCore<W> {
    pub fn new(config: &HubConfig) -> Self {
        Self::with_session(config, HubSessionId::generate())
    }

    pub fn with_session(config: &HubConfig, session: HubSessionId) -> Self {
        Self {
            session,
            registry: PeerRegistry::new(),
            pending: CorrelationTable::new(new_generation()),
            requests_limit: config.requests_limit,
            default_alive_timeout_ms: config.alive_timeout_ms(),
            stats: HubStats::default(),
            closed: false,
        }
    }

    pub fn session(&self) -> &HubSessionId {
        &self.session
    }

    /// Process one inbound frame. Frames must be fed in arrival order.
    pub fn on_message(&mut self, envelope: EnvelopeId, msg: Message, now: u64) -> Vec<HubAction<W>> {
        let sender = self.registry.touch(envelope, now);
        let mut actions = Vec::new();
        match msg {
            Message::Hello {
                identity,
                alive_timeout,
            } => {
                self.stats.hellos += 1;
                let peer = LogicalId::from(identity);
                let timeout = alive_timeout
                    .map(secs_to_ms)
                    .unwrap_or(self.default_alive_timeout_ms);
                let is_new = self.registry.upsert_hello(&peer, envelope, timeout, now);
                actions.push(HubAction::Send(
                    envelope,
                    Message::Hello {
                        identity: self.session.to_string(),
                        alive_timeout: None,
                    },
                ));
                if is_new {
                    info!(peer = %peer, envelope = %envelope, "peer registered");
                    actions.push(HubAction::PeerConnected(peer));
                }
            }
            Message::Close => {
                if let Some(peer) = sender {
                    self.registry.remove(&peer);
                    info!(peer = %peer, "peer closed");
                    actions.push(HubAction::PeerClosed {
                        peer,
                        timed_out: false,
                    });
                }
            }
            Message::Ping => {
                self.stats.pings += 1;
                actions.push(HubAction::Send(envelope, Message::Pong));
                match sender {
                    Some(peer) => actions.push(HubAction::Ping(peer)),
                    // We dropped this peer (inactivity); make it register again.
                    None => actions.push(HubAction::Send(envelope, Message::ReHello)),
                }
            }
            Message::Call { id, method, params } => {
                self.stats.requests += 1;
                self.admit(envelope, sender, id, method, params, &mut actions);
            }
            Message::Response { id, result } => {
                self.stats.responses += 1;
                self.complete(&id, Ok(result), &mut actions);
            }
            Message::ResponseError { id, error } => {
                self.stats.responses += 1;
                self.complete(&id, Err(error), &mut actions);
            }
            Message::Event { body } => match sender {
                Some(peer) => actions.push(HubAction::Event { peer, body }),
                None => debug!(envelope = %envelope, "event from unregistered connection dropped"),
            },
            Message::Pong | Message::Retry { .. } | Message::ReHello => {
                debug!(envelope = %envelope, "ignoring peer-only frame");
            }
        }
        actions
    }

    fn admit(
        &mut self,
        envelope: EnvelopeId,
        sender: Option<LogicalId>,
        id: CallId,
        method: String,
        params: Value,
        actions: &mut Vec<HubAction<W>>,
    ) {
        let Some(record) = sender.as_ref().and_then(|p| self.registry.get_mut(p)) else {
            // No hello yet: nothing to attribute the call to.
            self.stats.retries += 1;
            actions.push(HubAction::Send(envelope, Message::Retry { id, backoff: 1 }));
            return;
        };
        if record.in_flight.contains(&id) {
            self.stats.duplicates += 1;
            debug!(peer = %record.logical_id, call = %id, "duplicate call ignored");
            return;
        }
        if record.in_flight.len() > self.requests_limit {
            self.stats.retries += 1;
            let depth = record.in_flight.len();
            debug!(peer = %record.logical_id, call = %id, depth, "over request limit, deferring");
            actions.push(HubAction::Send(
                envelope,
                Message::Retry {
                    id,
                    backoff: u32::try_from(depth).unwrap_or(u32::MAX),
                },
            ));
            return;
        }
        record.in_flight.insert(id);
        record.total_calls += 1;
        actions.push(HubAction::Dispatch {
            peer: record.logical_id.clone(),
            envelope,
            id,
            method,
            params,
        });
    }

    fn complete(
        &mut self,
        id: &CallId,
        outcome: Result<Value, RemoteError>,
        actions: &mut Vec<HubAction<W>>,
    ) {
        match self.pending.complete(id) {
            Some(call) => actions.push(HubAction::Complete {
                waiter: call.waiter,
                outcome,
            }),
            None => debug!(call = %id, "response for unknown call"),
        }
    }

    /// Liveness sweep: drop peers silent longer than their alive timeout.
    pub fn sweep(&mut self, now: u64) -> Vec<HubAction<W>> {
        let mut actions = Vec::new();
        for peer in self.registry.expired(now) {
            if let Some(record) = self.registry.remove(&peer) {
                self.stats.timeouts += 1;
                warn!(
                    peer = %peer,
                    silent_ms = now.saturating_sub(record.last_seen),
                    timeout_ms = record.alive_timeout_ms,
                    "peer inactive, marking as dead"
                );
                actions.push(HubAction::PeerClosed {
                    peer,
                    timed_out: true,
                });
            }
        }
        actions
    }

    /// Start a hub-initiated call to `peer`.
    pub fn begin_call(
        &mut self,
        peer: &LogicalId,
        method: String,
        params: Value,
        waiter: W,
    ) -> Result<OutboundCall, HubError> {
        if self.closed {
            return Err(HubError::Closed);
        }
        let envelope = self
            .registry
            .envelope_of(peer)
            .ok_or_else(|| HubError::PeerNotFound(peer.clone()))?;
        let id = self.pending.insert(method, params, waiter);
        self.pending.set_sent(&id, true);
        let frame = self
            .pending
            .get(&id)
            .map(|c| c.call_frame())
            .ok_or(HubError::CallVanished(id))?;
        Ok(OutboundCall {
            id,
            envelope,
            frame,
        })
    }

    /// Forget a call whose frame could not be written; returns its waiter if still pending.
    pub fn abandon_call(&mut self, id: &CallId) -> Option<W> {
        self.pending.complete(id).map(|c| c.waiter)
    }

    /// Address an event to `peer`.
    pub fn event_frame(&self, peer: &LogicalId, body: Value) -> Result<(EnvelopeId, Message), HubError> {
        let envelope = self
            .registry
            .envelope_of(peer)
            .ok_or_else(|| HubError::PeerNotFound(peer.clone()))?;
        Ok((envelope, Message::Event { body }))
    }

    /// The handler for an admitted call finished; its id may be used again.
    pub fn release_inbound(&mut self, peer: &LogicalId, id: &CallId) -> bool {
        self.registry
            .get_mut(peer)
            .map(|r| r.in_flight.remove(id))
            .unwrap_or(false)
    }

    /// Where replies for `peer` go now (it may have reconnected since the call arrived).
    pub fn reply_route(&self, peer: &LogicalId) -> Option<EnvelopeId> {
        self.registry.envelope_of(peer)
    }

    /// Drop all hub-initiated calls and refuse new ones; returns their waiters.
    pub fn close(&mut self) -> Vec<W> {
        self.closed = true;
        self.pending.drain().into_iter().map(|c| c.waiter).collect()
    }

    pub fn peer(&self, peer: &LogicalId) -> Option<&PeerRecord> {
        self.registry.get(peer)
    }

    pub fn peer_ids(&self) -> Vec<LogicalId> {
        self.registry.ids()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> HubStats {
        self.stats
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum HubError {
    #[error("Peer {0} not found")]
    PeerNotFound(LogicalId),
    #[error("call {0} vanished before it was sent")]
    CallVanished(CallId),
    #[error("closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const E1: EnvelopeId = EnvelopeId(1);
    const E2: EnvelopeId = EnvelopeId(2);

    fn hub(limit: usize) -> HubCore<u32> {
        let config = HubConfig {
            requests_limit: limit,
            alive_timeout_secs: 1.0,
            ..HubConfig::default()
        };
        HubCore::with_session(&config, HubSessionId::from("hub-a".to_owned()))
    }

    fn hello(id: &str) -> Message {
        Message::Hello {
            identity: id.into(),
            alive_timeout: None,
        }
    }

    fn call(seq: u64) -> Message {
        Message::Call {
            id: CallId::new(1, seq),
            method: "work".into(),
            params: json!(seq),
        }
    }

    fn dispatched(actions: &[HubAction<u32>]) -> Vec<CallId> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Dispatch { id, .. } => Some(*id),
                _ => None,
            })
            .collect()
    }

    fn retries(actions: &[HubAction<u32>]) -> Vec<(CallId, u32)> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Send(_, Message::Retry { id, backoff }) => Some((*id, *backoff)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hello_replies_with_session_and_connects_once() {
        let mut hub = hub(25);
        let actions = hub.on_message(E1, hello("p1"), 0);
        assert!(matches!(
            &actions[0],
            HubAction::Send(E1, Message::Hello { identity, .. }) if identity == "hub-a"
        ));
        assert!(matches!(&actions[1], HubAction::PeerConnected(p) if p.as_str() == "p1"));
        let again = hub.on_message(E2, hello("p1"), 10);
        assert_eq!(again.len(), 1);
        assert_eq!(hub.reply_route(&LogicalId::from("p1")), Some(E2));
    }

    #[test]
    fn call_before_hello_is_deferred() {
        let mut hub = hub(25);
        let actions = hub.on_message(E1, call(0), 0);
        assert_eq!(retries(&actions), vec![(CallId::new(1, 0), 1)]);
        assert!(dispatched(&actions).is_empty());
    }

    #[test]
    fn duplicate_in_flight_call_is_ignored() {
        let mut hub = hub(25);
        hub.on_message(E1, hello("p1"), 0);
        assert_eq!(dispatched(&hub.on_message(E1, call(0), 1)).len(), 1);
        assert!(hub.on_message(E1, call(0), 2).is_empty());
        assert_eq!(hub.stats().duplicates, 1);
    }

    #[test]
    fn released_id_is_dispatched_again() {
        let mut hub = hub(25);
        let p1 = LogicalId::from("p1");
        hub.on_message(E1, hello("p1"), 0);
        hub.on_message(E1, call(0), 1);
        assert!(hub.release_inbound(&p1, &CallId::new(1, 0)));
        assert!(!hub.release_inbound(&p1, &CallId::new(1, 0)));
        assert_eq!(dispatched(&hub.on_message(E1, call(0), 2)).len(), 1);
        assert_eq!(hub.peer(&p1).unwrap().total_calls, 2);
    }

    #[test]
    fn admission_control_defers_past_limit() {
        let mut hub = hub(2);
        hub.on_message(E1, hello("p1"), 0);
        // Sizes 0, 1, 2 are not above the limit of 2.
        for seq in 0..3 {
            assert_eq!(dispatched(&hub.on_message(E1, call(seq), 1)).len(), 1);
        }
        let actions = hub.on_message(E1, call(3), 1);
        assert_eq!(retries(&actions), vec![(CallId::new(1, 3), 3)]);
        hub.release_inbound(&LogicalId::from("p1"), &CallId::new(1, 0));
        assert_eq!(dispatched(&hub.on_message(E1, call(3), 2)).len(), 1);
    }

    #[test]
    fn ping_from_forgotten_peer_asks_for_hello() {
        let mut hub = hub(25);
        let actions = hub.on_message(E1, Message::Ping, 0);
        assert!(matches!(&actions[0], HubAction::Send(E1, Message::Pong)));
        assert!(matches!(&actions[1], HubAction::Send(E1, Message::ReHello)));

        hub.on_message(E1, hello("p1"), 0);
        let actions = hub.on_message(E1, Message::Ping, 1);
        assert!(matches!(&actions[1], HubAction::Ping(p) if p.as_str() == "p1"));
    }

    #[test]
    fn sweep_times_out_exactly_once() {
        let mut hub = hub(25);
        let p1 = LogicalId::from("p1");
        hub.on_message(E1, hello("p1"), 0);
        hub.on_message(E1, Message::Ping, 900);
        assert!(hub.sweep(1_900).is_empty());
        let actions = hub.sweep(1_901);
        assert!(matches!(
            &actions[..],
            [HubAction::PeerClosed { timed_out: true, .. }]
        ));
        assert!(hub.sweep(5_000).is_empty());
        assert!(matches!(
            hub.begin_call(&p1, "m".into(), json!({}), 0),
            Err(HubError::PeerNotFound(_))
        ));
    }

    #[test]
    fn advertised_alive_timeout_wins() {
        let mut hub = hub(25);
        hub.on_message(
            E1,
            Message::Hello {
                identity: "p1".into(),
                alive_timeout: Some(0.1),
            },
            0,
        );
        assert_eq!(hub.sweep(101).len(), 1);
    }

    #[test]
    fn close_from_peer_reports_graceful_close() {
        let mut hub = hub(25);
        hub.on_message(E1, hello("p1"), 0);
        let actions = hub.on_message(E1, Message::Close, 1);
        assert!(matches!(
            &actions[..],
            [HubAction::PeerClosed { timed_out: false, .. }]
        ));
        assert!(hub.peer_ids().is_empty());
    }

    #[test]
    fn unknown_peer_not_found() {
        let mut hub = hub(25);
        let err = hub
            .begin_call(&LogicalId::from("no-such-id"), "m".into(), json!({}), 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "Peer no-such-id not found");
        let err = hub
            .event_frame(&LogicalId::from("no-such-id"), json!({}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Peer no-such-id not found");
    }

    #[test]
    fn back_call_completes_once() {
        let mut hub = hub(25);
        let p1 = LogicalId::from("p1");
        hub.on_message(E1, hello("p1"), 0);
        let out = hub.begin_call(&p1, "callback".into(), json!("x"), 42).unwrap();
        assert_eq!(out.envelope, E1);
        let response = Message::Response {
            id: out.id,
            result: json!("done"),
        };
        let actions = hub.on_message(E1, response.clone(), 1);
        assert!(matches!(
            &actions[..],
            [HubAction::Complete { waiter: 42, outcome: Ok(v) }] if *v == json!("done")
        ));
        assert!(hub.on_message(E1, response, 2).is_empty());
    }

    #[test]
    fn close_returns_outstanding_waiters() {
        let mut hub = hub(25);
        let p1 = LogicalId::from("p1");
        hub.on_message(E1, hello("p1"), 0);
        hub.begin_call(&p1, "a".into(), json!(null), 1).unwrap();
        hub.begin_call(&p1, "b".into(), json!(null), 2).unwrap();
        assert_eq!(hub.close(), vec![1, 2]);
        assert_eq!(hub.pending_calls(), 0);
    }

    #[test]
    fn closed_hub_refuses_new_calls() {
        let mut hub = hub(25);
        let p1 = LogicalId::from("p1");
        hub.on_message(E1, hello("p1"), 0);
        hub.close();
        assert!(matches!(
            hub.begin_call(&p1, "late".into(), json!(null), 3),
            Err(HubError::Closed)
        ));
        assert_eq!(hub.pending_calls(), 0);
    }

    #[test]
    fn events_from_registered_peers_only() {
        let mut hub = hub(25);
        let body = Message::Event { body: json!(1) };
        assert!(hub.on_message(E1, body.clone(), 0).is_empty());
        hub.on_message(E1, hello("p1"), 0);
        assert!(matches!(
            &hub.on_message(E1, body, 1)[..],
            [HubAction::Event { .. }]
        ));
    }
}
