//! Tokio runtime for the hub/peer RPC protocol.
//!
//! `Hub` accepts many peers on one TCP listener; `Peer` keeps one connection to a hub
//! and hides reconnects and hub restarts from its callers. Both drive the sans-io
//! state machines in `hubrpc-core` and take their clock and timers from an injected
//! [`TickService`].

pub mod error;
pub mod handler;
pub mod hub;
pub mod peer;
pub mod tasks;
pub mod tick;
pub mod transport;

pub use error::{RpcError, TransportError};
pub use handler::{HubHandler, NoopPeerHandler, PeerHandler, Responder};
pub use hub::Hub;
pub use hubrpc_core::{HubConfig, HubSessionId, HubStats, LogicalId, PeerConfig, RemoteError};
pub use peer::Peer;
pub use tick::{TickCallback, TickRegistration, TickService, TokioTicks};
