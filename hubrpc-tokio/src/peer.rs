//! Peer engine: one logical connection to a hub, reconnected transparently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use hubrpc_core::{
    CallId, HubSessionId, LogicalId, Message, PeerAction, PeerConfig, PeerCore, RemoteError,
    SessionState,
};
use serde_json::Value;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::RpcError;
use crate::handler::{run_handler, PeerHandler, ReplySink, Responder};
use crate::tasks::{HookQueue, TaskSet};
use crate::tick::{TickRegistration, TickService};
use crate::transport::{self, ConnectionWriter};

/// How long `close` waits for the goodbye frame to be written.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

type Waiter = oneshot::Sender<Result<Value, RemoteError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    Waiting,
    Registered(HubSessionId),
    Closed,
}

struct PeerState {
    core: PeerCore<Waiter>,
    link: Option<ConnectionWriter>,
}

struct Shared {
    config: PeerConfig,
    logical_id: LogicalId,
    state: Mutex<PeerState>,
    handler: Arc<dyn PeerHandler>,
    ticks: Arc<dyn TickService>,
    registration: watch::Sender<Registration>,
    tasks: TaskSet,
    hooks: HookQueue,
}

struct PeerInner {
    shared: Arc<Shared>,
    ping: StdMutex<Option<TickRegistration>>,
    closed: AtomicBool,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        self.shared.tasks.abort_all();
    }
}

/// Connected (or reconnecting) peer. Cheap to clone.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Start connecting to the hub. Returns immediately; calls made before registration
    /// are buffered and sent once the hub answers hello.
    pub fn connect(config: PeerConfig, handler: Arc<dyn PeerHandler>, ticks: Arc<dyn TickService>) -> Peer {
        let core = PeerCore::new(&config);
        let logical_id = core.logical_id().clone();
        let (registration, _) = watch::channel(Registration::Waiting);
        let ping_interval = config.ping_interval();
        let tasks = TaskSet::new();
        let hooks = HookQueue::start(&tasks);
        let shared = Arc::new(Shared {
            config,
            logical_id,
            state: Mutex::new(PeerState { core, link: None }),
            handler,
            ticks: ticks.clone(),
            registration,
            tasks,
            hooks,
        });
        shared.tasks.spawn(link_loop(shared.clone()));

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let ping = ticks.register(
            ping_interval,
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let task = shared.clone();
                    shared.tasks.spawn(async move { task.ping().await });
                }
            }),
        );

        Peer {
            inner: Arc::new(PeerInner {
                shared,
                ping: StdMutex::new(Some(ping)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn logical_id(&self) -> &LogicalId {
        &self.inner.shared.logical_id
    }

    /// Wait until the hub has answered hello on the current connection.
    pub async fn wait_registered(&self) -> Result<HubSessionId, RpcError> {
        let mut rx = self.inner.shared.registration.subscribe();
        let current = rx
            .wait_for(|r| !matches!(r, Registration::Waiting))
            .await
            .map_err(|_| RpcError::Closed)?;
        match &*current {
            Registration::Registered(hub) => Ok(hub.clone()),
            _ => Err(RpcError::Closed),
        }
    }

    /// Session id of the hub we are (or were last) registered with.
    pub async fn hub_session(&self) -> Option<HubSessionId> {
        self.inner.shared.state.lock().await.core.hub().cloned()
    }

    /// Tick clock (ms) of the last pong from the hub.
    pub async fn last_pong(&self) -> Option<u64> {
        self.inner.shared.state.lock().await.core.last_pong()
    }

    /// Call `method` on the hub. Survives reconnects and hub restarts: the call is re-sent
    /// with the same id until it is answered or the peer is closed.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        let (id, send_now) = {
            let mut state = self.inner.shared.state.lock().await;
            // `close` may have drained the core since the check above.
            let Some((id, frame)) = state.core.begin_call(method.to_owned(), params, tx) else {
                return Err(RpcError::Closed);
            };
            (id, frame.zip(state.link.clone()))
        };
        if let Some((frame, link)) = send_now {
            if let Err(err) = link.send(frame).await {
                warn!(peer = %self.logical_id(), call = %id, error = %err, "call write failed");
                let _ = self.inner.shared.state.lock().await.core.abandon_call(&id);
                return Err(err.into());
            }
        }
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(RpcError::Remote(remote)),
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Send an event to the hub. At most once; not retried.
    pub async fn fire_event(&self, body: Value) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let link = {
            let state = self.inner.shared.state.lock().await;
            match (&state.link, state.core.state()) {
                (Some(link), SessionState::Registered) => link.clone(),
                _ => return Err(RpcError::NotConnected),
            }
        };
        link.send(Message::Event { body }).await?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Fail every pending call with `Closed`, stop keepalive, say goodbye to the hub
    /// (best effort) and drop the connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut ping) = self.inner.ping.lock() {
            if let Some(mut reg) = ping.take() {
                reg.stop();
            }
        }
        let shared = &self.inner.shared;
        let (waiters, link) = {
            let mut state = shared.state.lock().await;
            (state.core.close(), state.link.take())
        };
        let rejected = waiters.len();
        drop(waiters);
        shared.registration.send_replace(Registration::Closed);
        if let Some(link) = link {
            match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, link.send(Message::Close)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(error = %err, "close frame not delivered"),
                Err(_) => debug!("close frame timed out"),
            }
        }
        shared.tasks.shutdown().await;
        info!(peer = %shared.logical_id, rejected, "peer closed");
    }
}

impl Shared {
    fn label(&self) -> String {
        format!("{}@{}:{}", self.logical_id, self.config.host, self.config.port)
    }

    async fn ping(&self) {
        let state = self.state.lock().await;
        if let (Some(ping), Some(link)) = (state.core.ping(), &state.link) {
            link.send_detached(ping);
        }
    }

    /// Mirror the core's registration into the watch channel.
    fn publish(&self, core: &PeerCore<Waiter>) {
        let current = match (core.state(), core.hub()) {
            (SessionState::Registered, Some(hub)) => Registration::Registered(hub.clone()),
            _ => Registration::Waiting,
        };
        self.registration.send_if_modified(|r| {
            if *r == current || *r == Registration::Closed {
                return false;
            }
            *r = current;
            true
        });
    }
}

async fn link_loop(shared: Arc<Shared>) {
    let label = shared.label();
    loop {
        match transport::connect(&shared.config.host, shared.config.port).await {
            Ok(stream) => {
                info!(conn = %label, "connected to hub");
                run_link(&shared, stream, &label).await;
                info!(conn = %label, "disconnected from hub");
            }
            Err(err) => debug!(conn = %label, error = %err, "connect failed"),
        }
        tokio::time::sleep(shared.config.reconnect_interval()).await;
    }
}

async fn run_link(shared: &Arc<Shared>, stream: TcpStream, label: &str) {
    let (reader, writer) = stream.into_split();
    let (writer, write_loop) = ConnectionWriter::new(writer, label);
    {
        let mut state = shared.state.lock().await;
        let hello = state.core.on_connected();
        writer.send_detached(hello);
        state.link = Some(writer);
    }
    tokio::select! {
        _ = write_loop => {}
        _ = read_loop(shared, reader, label) => {}
    }
    let mut state = shared.state.lock().await;
    state.link = None;
    state.core.on_disconnected();
    shared.publish(&state.core);
}

async fn read_loop(shared: &Arc<Shared>, mut reader: OwnedReadHalf, label: &str) {
    loop {
        let msg = match transport::read_message(&mut reader, label).await {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(err) => {
                debug!(conn = %label, error = %err, "read failed");
                return;
            }
        };
        let now = shared.ticks.now();
        let mut state = shared.state.lock().await;
        let actions = state.core.on_message(msg, now);
        let mut reconnect = false;
        for action in actions {
            reconnect |= perform(shared, &state, action);
        }
        shared.publish(&state.core);
        if reconnect {
            info!(conn = %label, "hub said goodbye");
            return;
        }
    }
}

/// Returns true when the connection should be dropped.
fn perform(shared: &Arc<Shared>, state: &PeerState, action: PeerAction<Waiter>) -> bool {
    match action {
        PeerAction::Send(msg) => match &state.link {
            Some(link) => link.send_detached(msg),
            None => debug!("no connection, frame dropped"),
        },
        PeerAction::Registered(hub) => {
            let handler = shared.handler.clone();
            shared
                .hooks
                .push(async move { handler.on_registered(&hub).await });
        }
        PeerAction::Dispatch { id, method, params } => dispatch(shared, id, method, params),
        PeerAction::Complete { waiter, outcome } => {
            let _ = waiter.send(outcome);
        }
        PeerAction::ScheduleResend { id, ticks } => {
            let task = shared.clone();
            shared.tasks.spawn(async move {
                task.ticks.wait_ticks(ticks).await;
                let mut state = task.state.lock().await;
                if let Some(frame) = state.core.resend(&id) {
                    if let Some(link) = &state.link {
                        link.send_detached(frame);
                    }
                }
            });
        }
        PeerAction::Event(body) => {
            let handler = shared.handler.clone();
            shared.hooks.push(async move { handler.on_event(body).await });
        }
        PeerAction::Reconnect => return true,
    }
    false
}

fn dispatch(shared: &Arc<Shared>, id: CallId, method: String, params: Value) {
    let shared = shared.clone();
    tokio::spawn(async move {
        let sink: Arc<dyn ReplySink> = Arc::new(PeerReply {
            shared: shared.clone(),
        });
        let responder = Responder::new(id, sink.clone());
        let handler = shared.handler.clone();
        run_handler(id, &method, sink, handler.on_request(&method, params, responder)).await;
    });
}

struct PeerReply {
    shared: Arc<Shared>,
}

#[async_trait::async_trait]
impl ReplySink for PeerReply {
    async fn reply(&self, id: CallId, outcome: Result<Value, RemoteError>) {
        let msg = match outcome {
            Ok(result) => Message::Response { id, result },
            Err(error) => Message::ResponseError { id, error },
        };
        match &self.shared.state.lock().await.link {
            Some(link) => link.send_detached(msg),
            None => debug!(call = %id, "not connected, response dropped"),
        }
    }
}
