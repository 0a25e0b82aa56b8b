//! Identities used by the protocol: logical peer ids, transport envelopes, hub sessions, call ids.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Stable application-level id of a peer. Survives reconnects.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Self {
        LogicalId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalId {
    fn from(s: &str) -> Self {
        LogicalId(s.to_owned())
    }
}

impl From<String> for LogicalId {
    fn from(s: String) -> Self {
        LogicalId(s)
    }
}

/// Transport-level identity of one open connection on the hub side.
/// Assigned by the transport binding; a reconnecting peer gets a fresh one.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct EnvelopeId(pub u64);

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hub identity for one process lifetime. Peers compare it across hellos to detect hub restarts.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct HubSessionId(String);

impl HubSessionId {
    /// Fresh random session id (UUID v4).
    pub fn generate() -> Self {
        HubSessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HubSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for HubSessionId {
    fn from(s: String) -> Self {
        HubSessionId(s)
    }
}

/// Correlation id of one call: engine generation plus a monotonic counter.
///
/// The generation is a random nonce drawn once per engine instance, so ids from a
/// restarted process never collide with ids the other side still tracks.
/// Wire form: `{generation:016x}-{seq}`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CallId {
    pub generation: u64,
    pub seq: u64,
}

impl CallId {
    pub fn new(generation: u64, seq: u64) -> Self {
        Self { generation, seq }
    }
}

/// Draw a random generation nonce for a new engine instance.
pub fn new_generation() -> u64 {
    rand::random()
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{}", self.generation, self.seq)
    }
}

impl FromStr for CallId {
    type Err = ParseCallIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (generation, seq) = s
            .split_once('-')
            .ok_or_else(|| ParseCallIdError(s.to_owned()))?;
        if generation.len() != 16 {
            return Err(ParseCallIdError(s.to_owned()));
        }
        let generation =
            u64::from_str_radix(generation, 16).map_err(|_| ParseCallIdError(s.to_owned()))?;
        let seq = seq.parse::<u64>().map_err(|_| ParseCallIdError(s.to_owned()))?;
        Ok(CallId { generation, seq })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed call id {0:?}")]
pub struct ParseCallIdError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_id_wire_form_parses_back() {
        let id = CallId::new(0xdead_beef, 42);
        let text = id.to_string();
        assert_eq!(text, "00000000deadbeef-42");
        assert_eq!(text.parse::<CallId>().unwrap(), id);
    }

    #[test]
    fn call_id_rejects_client_prefixed_strings() {
        assert!("client1-0".parse::<CallId>().is_err());
        assert!("".parse::<CallId>().is_err());
        assert!("00000000deadbeef-".parse::<CallId>().is_err());
        assert!("00000000deadbeef-1-2".parse::<CallId>().is_err());
    }

    #[test]
    fn hub_sessions_are_unique() {
        assert_ne!(HubSessionId::generate(), HubSessionId::generate());
    }
}
