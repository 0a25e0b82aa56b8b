//! Hub/peer wire protocol: opcodes and typed messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::{CallId, ParseCallIdError};
use crate::wire::{self, FrameDecodeError, FrameEncodeError, WireFrame};

/// Frame opcodes. Values are fixed on the wire and understood identically by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Hello = 1,
    Call = 2,
    Response = 3,
    ResponseError = 4,
    Event = 5,
    Ping = 6,
    Pong = 7,
    Retry = 8,
    Close = 9,
    ReHello = 10,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => Opcode::Hello,
            2 => Opcode::Call,
            3 => Opcode::Response,
            4 => Opcode::ResponseError,
            5 => Opcode::Event,
            6 => Opcode::Ping,
            7 => Opcode::Pong,
            8 => Opcode::Retry,
            9 => Opcode::Close,
            10 => Opcode::ReHello,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }
}

/// All protocol messages, one payload shape per opcode.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake. From a peer: its logical id and advertised alive timeout (seconds).
    /// From the hub: the hub session id.
    Hello {
        identity: String,
        alive_timeout: Option<f64>,
    },
    Call {
        id: CallId,
        method: String,
        params: Value,
    },
    Response {
        id: CallId,
        result: Value,
    },
    ResponseError {
        id: CallId,
        error: RemoteError,
    },
    /// Fire-and-forget, no correlation.
    Event {
        body: Value,
    },
    Ping,
    Pong,
    /// Admission control: re-send call `id` after `backoff` ticks.
    Retry {
        id: CallId,
        backoff: u32,
    },
    /// Graceful goodbye.
    Close,
    /// Hub lost track of the sender; peer must say hello again.
    ReHello,
}

/// Failure reported by the remote handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Capture a handler error: top-level message plus the full debug chain as the stack.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }

    fn from_payload(payload: &Value) -> Self {
        Self {
            message: payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            stack: payload
                .get("stack")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HelloPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    alive_timeout: Option<f64>,
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Hello { .. } => Opcode::Hello,
            Message::Call { .. } => Opcode::Call,
            Message::Response { .. } => Opcode::Response,
            Message::ResponseError { .. } => Opcode::ResponseError,
            Message::Event { .. } => Opcode::Event,
            Message::Ping => Opcode::Ping,
            Message::Pong => Opcode::Pong,
            Message::Retry { .. } => Opcode::Retry,
            Message::Close => Opcode::Close,
            Message::ReHello => Opcode::ReHello,
        }
    }

    /// Lower into the raw four-part frame.
    pub fn into_wire(self) -> WireFrame {
        let opcode = self.opcode() as u8;
        let (correlation_id, payload) = match self {
            Message::Hello {
                identity,
                alive_timeout,
            } => {
                let payload = match alive_timeout {
                    Some(_) => wire::encode_payload(&HelloPayload { alive_timeout }),
                    None => Vec::new(),
                };
                (identity, payload)
            }
            Message::Call { id, method, params } => {
                (id.to_string(), wire::encode_payload(&(method, params)))
            }
            Message::Response { id, result } => (id.to_string(), wire::encode_payload(&result)),
            Message::ResponseError { id, error } => {
                (id.to_string(), wire::encode_payload(&error))
            }
            Message::Event { body } => (String::new(), wire::encode_payload(&body)),
            Message::Retry { id, backoff } => (id.to_string(), wire::encode_payload(&backoff)),
            Message::Ping | Message::Pong | Message::Close | Message::ReHello => {
                (String::new(), Vec::new())
            }
        };
        WireFrame {
            opcode,
            correlation_id,
            payload,
            reserved: Vec::new(),
        }
    }

    /// Lift a raw frame. Unknown opcodes and malformed call ids are errors; a malformed
    /// payload is logged and read as `null` so the frame is still dispatched.
    pub fn from_wire(frame: WireFrame) -> Result<Message, WireError> {
        let opcode = Opcode::try_from(frame.opcode)?;
        let payload = wire::decode_payload(&frame.payload);
        let msg = match opcode {
            Opcode::Hello => Message::Hello {
                identity: frame.correlation_id,
                alive_timeout: payload.get("aliveTimeout").and_then(Value::as_f64),
            },
            Opcode::Call => {
                let id = frame.correlation_id.parse()?;
                let (method, params) = split_call(payload);
                Message::Call { id, method, params }
            }
            Opcode::Response => Message::Response {
                id: frame.correlation_id.parse()?,
                result: payload,
            },
            Opcode::ResponseError => Message::ResponseError {
                id: frame.correlation_id.parse()?,
                error: RemoteError::from_payload(&payload),
            },
            Opcode::Event => Message::Event { body: payload },
            Opcode::Ping => Message::Ping,
            Opcode::Pong => Message::Pong,
            Opcode::Retry => Message::Retry {
                id: frame.correlation_id.parse()?,
                backoff: payload
                    .as_u64()
                    .map(|n| n.min(u64::from(u32::MAX)) as u32)
                    .unwrap_or(1),
            },
            Opcode::Close => Message::Close,
            Opcode::ReHello => Message::ReHello,
        };
        Ok(msg)
    }

    /// Encode straight to length-prefixed bytes.
    pub fn to_bytes(self) -> Result<Vec<u8>, WireError> {
        Ok(wire::encode_frame(&self.into_wire())?)
    }
}

fn split_call(payload: Value) -> (String, Value) {
    match payload {
        Value::Array(items) => {
            let mut items = items.into_iter();
            let method = match items.next() {
                Some(Value::String(m)) => m,
                _ => String::new(),
            };
            (method, items.next().unwrap_or(Value::Null))
        }
        _ => (String::new(), Value::Null),
    }
}

/// Error converting between messages and frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error(transparent)]
    CallId(#[from] ParseCallIdError),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
}
