//! Hub engine: accepts peer connections, runs the frame loop and liveness sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use hubrpc_core::{
    CallId, EnvelopeId, HubAction, HubConfig, HubCore, HubSessionId, HubStats, LogicalId, Message,
    RemoteError,
};
use serde_json::Value;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::{RpcError, TransportError};
use crate::handler::{run_handler, HubHandler, ReplySink, Responder};
use crate::tasks::{HookQueue, TaskSet};
use crate::tick::{TickRegistration, TickService};
use crate::transport::{self, ConnectionWriter};

type Waiter = oneshot::Sender<Result<Value, RemoteError>>;

enum Inbound {
    Connected(EnvelopeId, ConnectionWriter),
    Frame(EnvelopeId, Message),
    Disconnected(EnvelopeId),
    Sweep,
}

struct HubState {
    core: HubCore<Waiter>,
    writers: HashMap<EnvelopeId, ConnectionWriter>,
}

struct Shared {
    state: Mutex<HubState>,
    handler: Arc<dyn HubHandler>,
    ticks: Arc<dyn TickService>,
    tasks: TaskSet,
    hooks: HookQueue,
}

struct HubInner {
    shared: Arc<Shared>,
    session: HubSessionId,
    local_addr: SocketAddr,
    sweep: StdMutex<Option<TickRegistration>>,
    closed: AtomicBool,
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.shared.tasks.abort_all();
    }
}

/// Running hub. Cheap to clone; all clones share one listener.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Bind and start serving. Port 0 picks a free port; see `bound_port`.
    pub async fn listen(
        config: HubConfig,
        handler: Arc<dyn HubHandler>,
        ticks: Arc<dyn TickService>,
    ) -> Result<Hub, RpcError> {
        let listener = transport::bind_listener(&config.host, config.port).await?;
        let local_addr = listener.local_addr()?;
        let core = HubCore::new(&config);
        let session = core.session().clone();
        info!(addr = %local_addr, session = %session, "hub listening");

        let tasks = TaskSet::new();
        let hooks = HookQueue::start(&tasks);
        let shared = Arc::new(Shared {
            state: Mutex::new(HubState {
                core,
                writers: HashMap::new(),
            }),
            handler,
            ticks: ticks.clone(),
            tasks,
            hooks,
        });
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        shared.tasks.spawn(frame_loop(shared.clone(), inbound_rx));
        shared
            .tasks
            .spawn(accept_loop(shared.clone(), listener, inbound_tx.clone()));

        let sweep = ticks.register(
            config.sweep_interval(),
            Arc::new(move || {
                let _ = inbound_tx.send(Inbound::Sweep);
            }),
        );

        Ok(Hub {
            inner: Arc::new(HubInner {
                shared,
                session,
                local_addr,
                sweep: StdMutex::new(Some(sweep)),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn bound_port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Identity sent in every hello reply. New on every start.
    pub fn session_id(&self) -> &HubSessionId {
        &self.inner.session
    }

    pub async fn peer_ids(&self) -> Vec<LogicalId> {
        self.inner.shared.state.lock().await.core.peer_ids()
    }

    pub async fn stats(&self) -> HubStats {
        self.inner.shared.state.lock().await.core.stats()
    }

    /// Call `method` on a connected peer.
    pub async fn call(&self, peer: &LogicalId, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        let (id, writer, frame) = {
            let mut state = self.inner.shared.state.lock().await;
            let out = state.core.begin_call(peer, method.to_owned(), params, tx)?;
            let writer = state.writers.get(&out.envelope).cloned();
            (out.id, writer, out.frame)
        };
        let written = match writer {
            Some(writer) => writer.send(frame).await,
            None => Err(TransportError::WriterClosed),
        };
        if let Err(err) = written {
            warn!(peer = %peer, call = %id, error = %err, "call write failed");
            self.abandon(&id).await;
            return Err(err.into());
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(RpcError::Remote(remote)),
            Err(_) => Err(RpcError::Closed),
        }
    }

    async fn abandon(&self, id: &CallId) {
        let _ = self.inner.shared.state.lock().await.core.abandon_call(id);
    }

    /// Send an event to a connected peer. No acknowledgement.
    pub async fn fire_event(&self, peer: &LogicalId, body: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let (writer, frame) = {
            let state = self.inner.shared.state.lock().await;
            let (envelope, frame) = state.core.event_frame(peer, body)?;
            (state.writers.get(&envelope).cloned(), frame)
        };
        let writer = writer.ok_or(RpcError::PeerNotFound(peer.clone()))?;
        writer.send(frame).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Stop listening and the liveness sweep, fail pending hub calls with `Closed`, and
    /// drop every connection. Running handlers are left to finish. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut sweep) = self.inner.sweep.lock() {
            if let Some(mut reg) = sweep.take() {
                reg.stop();
            }
        }
        let waiters = {
            let mut state = self.inner.shared.state.lock().await;
            state.writers.clear();
            state.core.close()
        };
        let rejected = waiters.len();
        drop(waiters);
        self.inner.shared.tasks.shutdown().await;
        info!(session = %self.inner.session, rejected, "hub closed");
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, inbound: mpsc::UnboundedSender<Inbound>) {
    let next_envelope = AtomicU64::new(1);
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let envelope = EnvelopeId(next_envelope.fetch_add(1, Ordering::Relaxed));
        debug!(envelope = %envelope, addr = %addr, "connection accepted");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(envelope = %envelope, error = %err, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        let (writer, write_loop) = ConnectionWriter::new(writer, envelope.to_string());
        if inbound.send(Inbound::Connected(envelope, writer)).is_err() {
            return;
        }
        let inbound = inbound.clone();
        shared.tasks.spawn(async move {
            tokio::select! {
                _ = write_loop => {}
                _ = read_loop(reader, envelope, &inbound) => {}
            }
            let _ = inbound.send(Inbound::Disconnected(envelope));
        });
    }
}

async fn read_loop(mut reader: OwnedReadHalf, envelope: EnvelopeId, inbound: &mpsc::UnboundedSender<Inbound>) {
    let label = envelope.to_string();
    loop {
        match transport::read_message(&mut reader, &label).await {
            Ok(Some(msg)) => {
                if inbound.send(Inbound::Frame(envelope, msg)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(envelope = %envelope, "connection closed by peer");
                return;
            }
            Err(err) => {
                debug!(envelope = %envelope, error = %err, "connection read failed");
                return;
            }
        }
    }
}

/// Sequential frame loop: every inbound frame and sweep goes through here in order.
async fn frame_loop(shared: Arc<Shared>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(event) = inbound.recv().await {
        let now = shared.ticks.now();
        let mut state = shared.state.lock().await;
        let actions = match event {
            Inbound::Connected(envelope, writer) => {
                state.writers.insert(envelope, writer);
                continue;
            }
            Inbound::Disconnected(envelope) => {
                state.writers.remove(&envelope);
                continue;
            }
            Inbound::Frame(envelope, msg) => state.core.on_message(envelope, msg, now),
            Inbound::Sweep => state.core.sweep(now),
        };
        for action in actions {
            perform(&shared, &state, action);
        }
    }
}

fn perform(shared: &Arc<Shared>, state: &HubState, action: HubAction<Waiter>) {
    match action {
        HubAction::Send(envelope, msg) => match state.writers.get(&envelope) {
            Some(writer) => writer.send_detached(msg),
            None => debug!(envelope = %envelope, "no connection for reply"),
        },
        HubAction::Dispatch {
            peer,
            envelope,
            id,
            method,
            params,
        } => dispatch(shared, peer, envelope, id, method, params),
        HubAction::Complete { waiter, outcome } => {
            let _ = waiter.send(outcome);
        }
        HubAction::PeerConnected(peer) => {
            let handler = shared.handler.clone();
            shared
                .hooks
                .push(async move { handler.on_peer_connected(&peer).await });
        }
        HubAction::PeerClosed { peer, timed_out } => {
            let handler = shared.handler.clone();
            shared
                .hooks
                .push(async move { handler.on_peer_closed(&peer, timed_out).await });
        }
        HubAction::Ping(peer) => {
            let handler = shared.handler.clone();
            shared.hooks.push(async move { handler.on_ping(&peer).await });
        }
        HubAction::Event { peer, body } => {
            let handler = shared.handler.clone();
            shared
                .hooks
                .push(async move { handler.on_event(&peer, body).await });
        }
    }
}

/// Run the handler on its own task. Not tracked by the task set: closing the hub
/// does not cancel it.
fn dispatch(
    shared: &Arc<Shared>,
    peer: LogicalId,
    envelope: EnvelopeId,
    id: CallId,
    method: String,
    params: Value,
) {
    let shared = shared.clone();
    tokio::spawn(async move {
        let sink: Arc<dyn ReplySink> = Arc::new(HubReply {
            shared: shared.clone(),
            peer: peer.clone(),
            envelope,
        });
        let responder = Responder::new(id, sink.clone());
        let handler = shared.handler.clone();
        run_handler(id, &method, sink, handler.on_request(&peer, &method, params, responder)).await;
        shared.state.lock().await.core.release_inbound(&peer, &id);
    });
}

struct HubReply {
    shared: Arc<Shared>,
    peer: LogicalId,
    envelope: EnvelopeId,
}

#[async_trait::async_trait]
impl ReplySink for HubReply {
    async fn reply(&self, id: CallId, outcome: Result<Value, RemoteError>) {
        let msg = match outcome {
            Ok(result) => Message::Response { id, result },
            Err(error) => Message::ResponseError { id, error },
        };
        let state = self.shared.state.lock().await;
        let route = state.core.reply_route(&self.peer).unwrap_or(self.envelope);
        match state.writers.get(&route) {
            Some(writer) => writer.send_detached(msg),
            None => debug!(peer = %self.peer, call = %id, "peer gone, response dropped"),
        }
    }
}
