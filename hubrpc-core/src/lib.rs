//! Hub/peer bidirectional RPC protocol.
//! Host-driven: no I/O; host passes frames and ticks and receives actions.

pub mod config;
pub mod correlation;
pub mod hub;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod wire;

pub use config::{HubConfig, PeerConfig};
pub use hub::{HubAction, HubCore, HubError, HubStats, OutboundCall};
pub use identity::{CallId, EnvelopeId, HubSessionId, LogicalId};
pub use peer::{PeerAction, PeerCore, SessionState};
pub use protocol::{Message, Opcode, RemoteError, WireError};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, WireFrame};
