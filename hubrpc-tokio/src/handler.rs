//! Application-facing handler traits and the one-shot responder.

use std::sync::Arc;

use hubrpc_core::{CallId, HubSessionId, LogicalId, RemoteError};
use serde_json::Value;

/// Hub-side application callbacks. Handlers run on their own tasks; several may
/// run at once for the same peer.
#[async_trait::async_trait]
pub trait HubHandler: Send + Sync + 'static {
    /// Handle a call from `peer`. Answer through `responder`; returning `Err` sends a
    /// response error instead. Returning `Ok` without answering leaves the caller waiting.
    async fn on_request(
        &self,
        peer: &LogicalId,
        method: &str,
        params: Value,
        responder: Responder,
    ) -> anyhow::Result<()>;

    /// First hello from a logical id the hub did not know.
    async fn on_peer_connected(&self, _peer: &LogicalId) {}

    /// The peer said goodbye, or (`timed_out`) went silent past its alive timeout.
    async fn on_peer_closed(&self, _peer: &LogicalId, _timed_out: bool) {}

    async fn on_ping(&self, _peer: &LogicalId) {}

    async fn on_event(&self, _peer: &LogicalId, _body: Value) {}
}

/// Peer-side application callbacks.
#[async_trait::async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    /// Handle a call from the hub. Unknown methods fail by default.
    async fn on_request(&self, method: &str, _params: Value, _responder: Responder) -> anyhow::Result<()> {
        anyhow::bail!("unknown method {method}")
    }

    /// Registered with a hub session not seen before (first connect or hub restart).
    async fn on_registered(&self, _hub: &HubSessionId) {}

    async fn on_event(&self, _body: Value) {}
}

/// Peer handler that serves nothing and ignores events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPeerHandler;

#[async_trait::async_trait]
impl PeerHandler for NoopPeerHandler {}

/// Where a responder delivers its answer.
#[async_trait::async_trait]
pub(crate) trait ReplySink: Send + Sync {
    async fn reply(&self, id: CallId, outcome: Result<Value, RemoteError>);
}

/// Answers one inbound call. Consumed by `send`, so a call is answered at most once.
pub struct Responder {
    id: CallId,
    sink: Arc<dyn ReplySink>,
}

impl Responder {
    pub(crate) fn new(id: CallId, sink: Arc<dyn ReplySink>) -> Self {
        Self { id, sink }
    }

    pub fn call_id(&self) -> CallId {
        self.id
    }

    /// Send the result back to the caller.
    pub async fn send(self, value: Value) {
        self.sink.reply(self.id, Ok(value)).await;
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").field("id", &self.id).finish()
    }
}

/// Run an application handler future and turn its error into a response error.
pub(crate) async fn run_handler<F>(id: CallId, method: &str, sink: Arc<dyn ReplySink>, handler: F)
where
    F: std::future::Future<Output = anyhow::Result<()>>,
{
    if let Err(err) = handler.await {
        tracing::warn!(call = %id, method, error = %err, "handler failed");
        sink.reply(id, Err(RemoteError::from_error(&err))).await;
    }
}
