//! Load settings from file and environment.

use std::path::PathBuf;

use anyhow::Context;
use hubrpc_core::{HubConfig, PeerConfig};
use serde::Deserialize;
use tracing::{debug, warn};

/// CLI settings. File: ~/.config/hubrpc/config.toml or /etc/hubrpc/config.toml.
/// Env overrides: HUBRPC_HOST, HUBRPC_PORT, HUBRPC_PEER_ID, HUBRPC_REQUESTS_LIMIT.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub peer: PeerSection,
}

/// Peer settings as they appear in the file; id and port may come from elsewhere.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSection {
    /// Logical id (default `hubrpc-<pid>`).
    #[serde(default = "default_peer_id")]
    pub id: String,
    #[serde(default = "default_peer_host")]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_alive_timeout_secs")]
    pub alive_timeout_secs: f64,
}

fn default_peer_id() -> String {
    format!("hubrpc-{}", std::process::id())
}
fn default_peer_host() -> String {
    "127.0.0.1".to_owned()
}
fn default_alive_timeout_secs() -> f64 {
    10.0
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            id: default_peer_id(),
            host: default_peer_host(),
            port: None,
            alive_timeout_secs: default_alive_timeout_secs(),
        }
    }
}

impl PeerSection {
    pub fn to_config(&self) -> anyhow::Result<PeerConfig> {
        let port = self
            .port
            .context("no hub port given (--port, HUBRPC_PORT or [peer] port in the config file)")?;
        let mut config = PeerConfig::new(self.id.clone(), self.host.clone(), port);
        config.alive_timeout_secs = self.alive_timeout_secs;
        Ok(config)
    }
}

/// Load settings: defaults, then config file (if present), then env vars.
pub fn load() -> Settings {
    let mut settings = load_file().unwrap_or_default();
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Apply environment overrides. Host and port apply to both roles.
pub fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("HUBRPC_HOST") {
        settings.hub.host = host.clone();
        settings.peer.host = host;
    }
    if let Some(port) = var("HUBRPC_PORT").and_then(|s| s.parse::<u16>().ok()) {
        settings.hub.port = port;
        settings.peer.port = Some(port);
    }
    if let Some(id) = var("HUBRPC_PEER_ID") {
        settings.peer.id = id;
    }
    if let Some(limit) = var("HUBRPC_REQUESTS_LIMIT").and_then(|s| s.parse::<usize>().ok()) {
        settings.hub.requests_limit = limit;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hubrpc/config.toml"));
    }
    out.push(PathBuf::from("/etc/hubrpc/config.toml"));
    out
}

fn load_file() -> Option<Settings> {
    let path = config_paths().into_iter().find(|p| p.exists())?;
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
            return None;
        }
    };
    match toml::from_str::<Settings>(&text) {
        Ok(settings) => {
            debug!(path = %path.display(), "loaded config file");
            Some(settings)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "config file invalid, using defaults");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_sections_are_optional() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.hub.requests_limit, 25);
        assert!(settings.peer.port.is_none());
        assert!(settings.peer.to_config().is_err());
    }

    #[test]
    fn file_values_fill_peer_config() {
        let settings: Settings = toml::from_str(
            "[hub]\nport = 7000\nrequests_limit = 5\n\n[peer]\nid = \"w9\"\nport = 7000\n",
        )
        .unwrap();
        assert_eq!(settings.hub.port, 7000);
        assert_eq!(settings.hub.requests_limit, 5);
        let peer = settings.peer.to_config().unwrap();
        assert_eq!(peer.id, "w9");
        assert_eq!(peer.port, 7000);
        assert_eq!(peer.host, "127.0.0.1");
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("HUBRPC_HOST", "10.0.0.2"),
            ("HUBRPC_PORT", "7100"),
            ("HUBRPC_PEER_ID", "env-peer"),
            ("HUBRPC_REQUESTS_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut settings = Settings::default();
        apply_env(&mut settings, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.hub.host, "10.0.0.2");
        assert_eq!(settings.hub.port, 7100);
        assert_eq!(settings.peer.port, Some(7100));
        assert_eq!(settings.peer.id, "env-peer");
        // Unparsable values are ignored.
        assert_eq!(settings.hub.requests_limit, 25);
    }
}
