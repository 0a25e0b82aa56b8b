//! Peer state machine: registration, call buffering and re-send across hub restarts.

use serde_json::Value;
use tracing::{debug, info};

use crate::config::PeerConfig;
use crate::correlation::CorrelationTable;
use crate::identity::{new_generation, CallId, HubSessionId, LogicalId};
use crate::protocol::{Message, RemoteError};

/// Registration with the hub on the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection.
    Unregistered,
    /// Connected, hello sent, no reply yet. Calls are buffered.
    AwaitingHello,
    Registered,
}

/// Something the host must do after feeding the peer an event.
#[derive(Debug)]
pub enum PeerAction<W> {
    Send(Message),
    /// First hello from a hub session we had not seen.
    Registered(HubSessionId),
    /// Run the application handler for a hub-initiated call.
    Dispatch {
        id: CallId,
        method: String,
        params: Value,
    },
    Complete {
        waiter: W,
        outcome: Result<Value, RemoteError>,
    },
    /// Hub deferred a call; re-send it after `ticks` ticks.
    ScheduleResend { id: CallId, ticks: u32 },
    Event(Value),
    /// Hub said goodbye; drop the connection and reconnect.
    Reconnect,
}

/// Peer protocol core.
pub struct PeerCore<W> {
    logical_id: LogicalId,
    alive_timeout_secs: f64,
    state: SessionState,
    hub: Option<HubSessionId>,
    pending: CorrelationTable<W>,
    last_pong: Option<u64>,
    closed: bool,
}

impl<W> PeerCore<W> {
    pub fn new(config: &PeerConfig) -> Self {
        Self {
            logical_id: LogicalId::new(config.id.clone()),
            alive_timeout_secs: config.alive_timeout_secs,
            state: SessionState::Unregistered,
            hub: None,
            pending: CorrelationTable::new(new_generation()),
            last_pong: None,
            closed: false,
        }
    }

    pub fn logical_id(&self) -> &LogicalId {
        &self.logical_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session id of the hub we last registered with.
    pub fn hub(&self) -> Option<&HubSessionId> {
        self.hub.as_ref()
    }

    pub fn last_pong(&self) -> Option<u64> {
        self.last_pong
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    pub fn hello(&self) -> Message {
        Message::Hello {
            identity: self.logical_id.to_string(),
            alive_timeout: Some(self.alive_timeout_secs),
        }
    }

    /// A connection is up. Returns the hello to send on it.
    pub fn on_connected(&mut self) -> Message {
        self.state = SessionState::AwaitingHello;
        self.hello()
    }

    /// The connection dropped. Calls stay pending; every one of them is re-sent on the
    /// next registration, since replies bound for the old connection are lost.
    pub fn on_disconnected(&mut self) {
        self.state = SessionState::Unregistered;
        self.pending.mark_all_unsent();
    }

    /// Track a new call. Returns the frame to send now, or `None` if it is buffered
    /// until registration. Refused (`None` overall) once the peer is closed.
    pub fn begin_call(
        &mut self,
        method: String,
        params: Value,
        waiter: W,
    ) -> Option<(CallId, Option<Message>)> {
        if self.closed {
            return None;
        }
        let id = self.pending.insert(method, params, waiter);
        if self.state != SessionState::Registered {
            debug!(call = %id, state = ?self.state, "call buffered until registered");
            return Some((id, None));
        }
        self.pending.set_sent(&id, true);
        let frame = self.pending.get(&id).map(|c| c.call_frame());
        Some((id, frame))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop a call whose frame could not be written.
    pub fn abandon_call(&mut self, id: &CallId) -> Option<W> {
        self.pending.complete(id).map(|c| c.waiter)
    }

    pub fn on_message(&mut self, msg: Message, now: u64) -> Vec<PeerAction<W>> {
        let mut actions = Vec::new();
        match msg {
            Message::Hello { identity, .. } => {
                let hub = HubSessionId::from(identity);
                self.state = SessionState::Registered;
                if self.hub.as_ref() == Some(&hub) {
                    actions.extend(self.pending.flush_unsent().into_iter().map(PeerAction::Send));
                } else {
                    // New hub session: it knows none of our calls.
                    info!(peer = %self.logical_id, hub = %hub, pending = self.pending.len(), "registered with hub");
                    self.hub = Some(hub.clone());
                    actions.push(PeerAction::Registered(hub));
                    actions.extend(self.pending.resend_all().into_iter().map(PeerAction::Send));
                }
            }
            Message::ReHello => {
                info!(peer = %self.logical_id, "hub asked for hello again");
                self.hub = None;
                self.state = SessionState::AwaitingHello;
                actions.push(PeerAction::Send(self.hello()));
            }
            Message::Close => {
                self.state = SessionState::Unregistered;
                actions.push(PeerAction::Reconnect);
            }
            Message::Ping => actions.push(PeerAction::Send(Message::Pong)),
            Message::Pong => self.last_pong = Some(now),
            Message::Call { id, method, params } => {
                actions.push(PeerAction::Dispatch { id, method, params })
            }
            Message::Response { id, result } => self.complete(&id, Ok(result), &mut actions),
            Message::ResponseError { id, error } => self.complete(&id, Err(error), &mut actions),
            Message::Retry { id, backoff } => {
                if self.pending.contains(&id) {
                    debug!(call = %id, backoff, "hub deferred call");
                    actions.push(PeerAction::ScheduleResend {
                        id,
                        ticks: backoff.max(1),
                    });
                } else {
                    debug!(call = %id, "retry for unknown call");
                }
            }
            Message::Event { body } => actions.push(PeerAction::Event(body)),
        }
        actions
    }

    fn complete(
        &mut self,
        id: &CallId,
        outcome: Result<Value, RemoteError>,
        actions: &mut Vec<PeerAction<W>>,
    ) {
        match self.pending.complete(id) {
            Some(call) => actions.push(PeerAction::Complete {
                waiter: call.waiter,
                outcome,
            }),
            None => debug!(call = %id, "response for unknown call"),
        }
    }

    /// A deferred call is due. Returns its frame, or `None` if it completed meanwhile or
    /// there is no registration to send it on (then it goes out with the next hello reply).
    pub fn resend(&mut self, id: &CallId) -> Option<Message> {
        let frame = self.pending.get(id)?.call_frame();
        if self.state != SessionState::Registered {
            self.pending.set_sent(id, false);
            return None;
        }
        Some(frame)
    }

    /// Keepalive frame, if connected.
    pub fn ping(&self) -> Option<Message> {
        match self.state {
            SessionState::Unregistered => None,
            _ => Some(Message::Ping),
        }
    }

    /// Drop every pending call and refuse new ones; returns their waiters.
    pub fn close(&mut self) -> Vec<W> {
        self.closed = true;
        self.state = SessionState::Unregistered;
        self.pending.drain().into_iter().map(|c| c.waiter).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn peer() -> PeerCore<u32> {
        PeerCore::new(&PeerConfig::new("w1", "127.0.0.1", 1))
    }

    fn begin(p: &mut PeerCore<u32>, method: &str, params: Value, waiter: u32) -> (CallId, Option<Message>) {
        p.begin_call(method.into(), params, waiter).expect("peer is open")
    }

    fn hub_hello(session: &str) -> Message {
        Message::Hello {
            identity: session.into(),
            alive_timeout: None,
        }
    }

    fn sent_calls(actions: &[PeerAction<u32>]) -> Vec<CallId> {
        actions
            .iter()
            .filter_map(|a| match a {
                PeerAction::Send(Message::Call { id, .. }) => Some(*id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn hello_advertises_identity_and_timeout() {
        let mut p = peer();
        match p.on_connected() {
            Message::Hello {
                identity,
                alive_timeout,
            } => {
                assert_eq!(identity, "w1");
                assert_eq!(alive_timeout, Some(10.0));
            }
            other => panic!("expected hello, got {other:?}"),
        }
        assert_eq!(p.state(), SessionState::AwaitingHello);
    }

    #[test]
    fn calls_buffer_until_registered() {
        let mut p = peer();
        let (id, frame) = begin(&mut p, "m", json!(1), 1);
        assert!(frame.is_none());
        p.on_connected();
        let actions = p.on_message(hub_hello("h1"), 0);
        assert!(matches!(&actions[0], PeerAction::Registered(h) if h.as_str() == "h1"));
        assert_eq!(sent_calls(&actions), vec![id]);

        let (_, frame) = begin(&mut p, "m", json!(2), 2);
        assert!(frame.is_some());
    }

    #[test]
    fn new_hub_session_resends_everything() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, _) = begin(&mut p, "a", json!(null), 1);
        let (b, _) = begin(&mut p, "b", json!(null), 2);

        p.on_disconnected();
        p.on_connected();
        let actions = p.on_message(hub_hello("h2"), 1);
        assert!(matches!(&actions[0], PeerAction::Registered(_)));
        assert_eq!(sent_calls(&actions), vec![a, b]);
    }

    #[test]
    fn same_hub_session_after_reconnect_resends_in_flight_calls() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, _) = begin(&mut p, "a", json!(null), 1);
        p.on_disconnected();
        let (b, _) = begin(&mut p, "b", json!(null), 2);
        p.on_connected();
        let actions = p.on_message(hub_hello("h1"), 1);
        assert!(!actions.iter().any(|a| matches!(a, PeerAction::Registered(_))));
        assert_eq!(sent_calls(&actions), vec![a, b]);
    }

    #[test]
    fn repeated_hello_on_live_connection_only_flushes_unsent() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        begin(&mut p, "a", json!(null), 1);
        assert!(sent_calls(&p.on_message(hub_hello("h1"), 1)).is_empty());
    }

    #[test]
    fn rehello_forgets_hub_and_resends_on_reply() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, _) = begin(&mut p, "a", json!(null), 1);

        let actions = p.on_message(Message::ReHello, 1);
        assert!(matches!(&actions[..], [PeerAction::Send(Message::Hello { .. })]));
        assert_eq!(p.state(), SessionState::AwaitingHello);
        assert!(p.hub().is_none());

        let actions = p.on_message(hub_hello("h1"), 2);
        assert!(matches!(&actions[0], PeerAction::Registered(_)));
        assert_eq!(sent_calls(&actions), vec![a]);
    }

    #[test]
    fn retry_schedules_resend_for_pending_only() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, _) = begin(&mut p, "a", json!(null), 1);
        let actions = p.on_message(Message::Retry { id: a, backoff: 26 }, 1);
        assert!(matches!(
            &actions[..],
            [PeerAction::ScheduleResend { ticks: 26, .. }]
        ));
        assert!(p
            .on_message(
                Message::Retry {
                    id: CallId::new(0, 99),
                    backoff: 1
                },
                1
            )
            .is_empty());
        assert!(matches!(p.resend(&a), Some(Message::Call { id, .. }) if id == a));
    }

    #[test]
    fn resend_while_disconnected_waits_for_registration() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, _) = begin(&mut p, "a", json!(null), 1);
        p.on_disconnected();
        assert!(p.resend(&a).is_none());
        p.on_connected();
        let actions = p.on_message(hub_hello("h1"), 1);
        assert_eq!(sent_calls(&actions), vec![a]);
    }

    #[test]
    fn response_completes_once() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, _) = begin(&mut p, "a", json!(null), 7);
        let err = Message::ResponseError {
            id: a,
            error: RemoteError::new("boom"),
        };
        let actions = p.on_message(err.clone(), 1);
        assert!(matches!(
            &actions[..],
            [PeerAction::Complete { waiter: 7, outcome: Err(e) }] if e.message == "boom"
        ));
        assert!(p.on_message(err, 2).is_empty());
        assert!(p.resend(&a).is_none());
    }

    #[test]
    fn keepalive_and_control_frames() {
        let mut p = peer();
        assert!(p.ping().is_none());
        p.on_connected();
        assert_eq!(p.ping(), Some(Message::Ping));
        assert!(matches!(
            &p.on_message(Message::Ping, 0)[..],
            [PeerAction::Send(Message::Pong)]
        ));
        p.on_message(Message::Pong, 42);
        assert_eq!(p.last_pong(), Some(42));
        assert!(matches!(
            &p.on_message(Message::Close, 50)[..],
            [PeerAction::Reconnect]
        ));
        assert_eq!(p.state(), SessionState::Unregistered);
    }

    #[test]
    fn hub_calls_are_dispatched() {
        let mut p = peer();
        let call = Message::Call {
            id: CallId::new(5, 0),
            method: "callback".into(),
            params: json!("x"),
        };
        assert!(matches!(
            &p.on_message(call, 0)[..],
            [PeerAction::Dispatch { method, .. }] if method == "callback"
        ));
    }

    #[test]
    fn close_returns_waiters() {
        let mut p = peer();
        begin(&mut p, "a", json!(null), 1);
        begin(&mut p, "b", json!(null), 2);
        assert_eq!(p.close(), vec![1, 2]);
        assert_eq!(p.pending_calls(), 0);
    }

    #[test]
    fn closed_peer_refuses_new_calls() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        p.close();
        assert!(p.is_closed());
        assert!(p.begin_call("late".into(), json!(null), 3).is_none());
        assert_eq!(p.pending_calls(), 0);
    }

    #[test]
    fn abandoned_call_ignores_a_late_response() {
        let mut p = peer();
        p.on_connected();
        p.on_message(hub_hello("h1"), 0);
        let (a, frame) = begin(&mut p, "a", json!(null), 9);
        assert!(frame.is_some());
        assert_eq!(p.abandon_call(&a), Some(9));
        assert_eq!(p.pending_calls(), 0);
        let late = Message::Response {
            id: a,
            result: json!(1),
        };
        assert!(p.on_message(late, 1).is_empty());
    }
}
