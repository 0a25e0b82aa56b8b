//! Correlation table: outstanding calls keyed by call id, owned by the side that issued them.

use std::collections::HashMap;

use serde_json::Value;

use crate::identity::CallId;
use crate::protocol::Message;

/// One outstanding call. `W` is whatever the host uses to wake the caller.
#[derive(Debug)]
pub struct PendingCall<W> {
    pub id: CallId,
    pub method: String,
    pub params: Value,
    pub waiter: W,
    /// Whether the call frame has been handed to a live connection.
    pub sent: bool,
}

impl<W> PendingCall<W> {
    /// The call frame, byte-for-byte what was (or will be) sent first.
    pub fn call_frame(&self) -> Message {
        Message::Call {
            id: self.id,
            method: self.method.clone(),
            params: self.params.clone(),
        }
    }
}

/// Pending calls of one engine. Each id is allocated once and removed at most once.
#[derive(Debug)]
pub struct CorrelationTable<W> {
    generation: u64,
    next_seq: u64,
    calls: HashMap<CallId, PendingCall<W>>,
}

impl<W> CorrelationTable<W> {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            next_seq: 0,
            calls: HashMap::new(),
        }
    }

    /// Allocate the next id and track the call (not yet sent).
    pub fn insert(&mut self, method: String, params: Value, waiter: W) -> CallId {
        let id = CallId::new(self.generation, self.next_seq);
        self.next_seq += 1;
        self.calls.insert(
            id,
            PendingCall {
                id,
                method,
                params,
                waiter,
                sent: false,
            },
        );
        id
    }

    /// Remove the call for a response. `None` if already completed or never issued.
    pub fn complete(&mut self, id: &CallId) -> Option<PendingCall<W>> {
        self.calls.remove(id)
    }

    pub fn get(&self, id: &CallId) -> Option<&PendingCall<W>> {
        self.calls.get(id)
    }

    pub fn contains(&self, id: &CallId) -> bool {
        self.calls.contains_key(id)
    }

    /// Record whether the call frame is on a live connection.
    pub fn set_sent(&mut self, id: &CallId, sent: bool) {
        if let Some(call) = self.calls.get_mut(id) {
            call.sent = sent;
        }
    }

    /// Frames for every outstanding call, oldest first; marks them sent.
    pub fn resend_all(&mut self) -> Vec<Message> {
        let mut ids: Vec<CallId> = self.calls.keys().copied().collect();
        ids.sort();
        self.take_frames(&ids)
    }

    /// Frames for calls that never reached a connection, oldest first; marks them sent.
    pub fn flush_unsent(&mut self) -> Vec<Message> {
        let mut ids: Vec<CallId> = self
            .calls
            .values()
            .filter(|c| !c.sent)
            .map(|c| c.id)
            .collect();
        ids.sort();
        self.take_frames(&ids)
    }

    /// The connection carrying the sent calls is gone; none of them count as sent any more.
    pub fn mark_all_unsent(&mut self) {
        for call in self.calls.values_mut() {
            call.sent = false;
        }
    }

    fn take_frames(&mut self, ids: &[CallId]) -> Vec<Message> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(call) = self.calls.get_mut(id) {
                call.sent = true;
                out.push(call.call_frame());
            }
        }
        out
    }

    /// Remove every outstanding call (connection closed).
    pub fn drain(&mut self) -> Vec<PendingCall<W>> {
        let mut calls: Vec<PendingCall<W>> = self.calls.drain().map(|(_, c)| c).collect();
        calls.sort_by_key(|c| c.id);
        calls
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
