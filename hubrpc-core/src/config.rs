//! Engine configuration. Deserializable so hosts can load it from TOML.

use std::time::Duration;

use serde::Deserialize;

/// Hub settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubConfig {
    /// Bind host; `*` binds every interface (default `*`).
    #[serde(default = "default_hub_host")]
    pub host: String,
    /// Bind port; 0 lets the OS choose (default 0).
    #[serde(default)]
    pub port: u16,
    /// In-flight calls per peer above which new calls are deferred with `retry` (default 25).
    #[serde(default = "default_requests_limit")]
    pub requests_limit: usize,
    /// Alive timeout for peers that do not advertise one (default 10s).
    #[serde(default = "default_alive_timeout_secs")]
    pub alive_timeout_secs: f64,
    /// Liveness sweep period (default 1000 ms).
    #[serde(default = "default_interval_ms")]
    pub sweep_interval_ms: u64,
}

/// Peer settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    /// Logical id announced in hello.
    pub id: String,
    #[serde(default = "default_peer_host")]
    pub host: String,
    pub port: u16,
    /// Advertised to the hub; silence longer than this gets the peer dropped (default 10s).
    #[serde(default = "default_alive_timeout_secs")]
    pub alive_timeout_secs: f64,
    /// Keepalive ping period (default 1000 ms).
    #[serde(default = "default_interval_ms")]
    pub ping_interval_ms: u64,
    /// Delay before reconnecting after the connection drops (default 250 ms).
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

fn default_hub_host() -> String {
    "*".to_owned()
}
fn default_peer_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_requests_limit() -> usize {
    25
}
fn default_alive_timeout_secs() -> f64 {
    10.0
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_reconnect_interval_ms() -> u64 {
    250
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: default_hub_host(),
            port: 0,
            requests_limit: default_requests_limit(),
            alive_timeout_secs: default_alive_timeout_secs(),
            sweep_interval_ms: default_interval_ms(),
        }
    }
}

impl HubConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn alive_timeout_ms(&self) -> u64 {
        secs_to_ms(self.alive_timeout_secs)
    }
}

impl PeerConfig {
    /// Defaults for everything but identity and address.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            alive_timeout_secs: default_alive_timeout_secs(),
            ping_interval_ms: default_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Convert advertised seconds to ms, clamping negatives and NaN to zero.
pub fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0) as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_defaults_from_empty_toml() {
        let cfg: HubConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.host, "*");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.requests_limit, 25);
        assert_eq!(cfg.alive_timeout_ms(), 10_000);
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn peer_requires_identity_and_port() {
        assert!(toml::from_str::<PeerConfig>("host = \"h\"").is_err());
        let cfg: PeerConfig = toml::from_str("id = \"w1\"\nport = 4000").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.reconnect_interval(), Duration::from_millis(250));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(toml::from_str::<HubConfig>("bogus = 1").is_err());
    }

    #[test]
    fn seconds_conversion_clamps() {
        assert_eq!(secs_to_ms(0.25), 250);
        assert_eq!(secs_to_ms(-1.0), 0);
        assert_eq!(secs_to_ms(f64::NAN), 0);
    }
}
