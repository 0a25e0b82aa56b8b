//! Runtime errors.

use hubrpc_core::{FrameDecodeError, HubError, LogicalId, RemoteError, WireError};

/// Failure reading or writing frames on a socket.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("connection writer closed")]
    WriterClosed,
}

/// Error returned to callers of `call` / `fire_event`.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The engine was closed while the call was pending.
    #[error("closed")]
    Closed,
    #[error("Peer {0} not found")]
    PeerNotFound(LogicalId),
    /// The remote handler failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HubError> for RpcError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::PeerNotFound(peer) => RpcError::PeerNotFound(peer),
            HubError::CallVanished(_) | HubError::Closed => RpcError::Closed,
        }
    }
}
