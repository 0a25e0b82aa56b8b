//! hubrpc: run a hub, or act as a one-shot peer against one.

mod config;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubrpc_tokio::{
    Hub, HubHandler, HubSessionId, LogicalId, Peer, PeerHandler, Responder, TickService, TokioTicks,
};
use serde_json::{json, Value};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "hubrpc", version)]
#[command(about = "Bidirectional hub/peer RPC over TCP")]
struct Args {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a hub until Ctrl+C or SIGTERM.
    Hub {
        /// Host to bind to (`*` for every interface)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (0 = auto-assign)
        #[arg(short, long)]
        port: Option<u16>,
        /// In-flight calls per peer before new ones are deferred
        #[arg(long)]
        requests_limit: Option<usize>,
    },
    /// Call a method on a hub and print the JSON result.
    Call {
        method: String,
        /// JSON params
        #[arg(default_value = "null")]
        params: String,
        #[command(flatten)]
        target: Target,
    },
    /// Fire an event at a hub.
    Event {
        /// JSON body
        body: String,
        #[command(flatten)]
        target: Target,
    },
}

#[derive(clap::Args, Debug)]
struct Target {
    /// Logical id to register as
    #[arg(long)]
    id: Option<String>,
    /// Hub host
    #[arg(long)]
    host: Option<String>,
    /// Hub port
    #[arg(short, long)]
    port: Option<u16>,
    /// Give up after this many seconds
    #[arg(long, default_value = "10")]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let mut settings = config::load();
    let ticks = TokioTicks::shared(hubrpc_tokio::tick::TICKS_PER_SECOND);

    match args.command {
        Command::Hub {
            host,
            port,
            requests_limit,
        } => {
            if let Some(host) = host {
                settings.hub.host = host;
            }
            if let Some(port) = port {
                settings.hub.port = port;
            }
            if let Some(limit) = requests_limit {
                settings.hub.requests_limit = limit;
            }
            run_hub(settings.hub, ticks).await
        }
        Command::Call {
            method,
            params,
            target,
        } => {
            let params: Value = serde_json::from_str(&params).context("params are not valid JSON")?;
            target.apply(&mut settings.peer);
            let peer = Peer::connect(settings.peer.to_config()?, Arc::new(CliPeer), ticks);
            let result = tokio::time::timeout(Duration::from_secs(target.timeout), peer.call(&method, params)).await;
            peer.close().await;
            let value = result.context("timed out waiting for the hub")??;
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Command::Event { body, target } => {
            let body: Value = serde_json::from_str(&body).context("event body is not valid JSON")?;
            target.apply(&mut settings.peer);
            let peer = Peer::connect(settings.peer.to_config()?, Arc::new(CliPeer), ticks);
            let sent = async {
                peer.wait_registered().await?;
                peer.fire_event(body).await
            };
            let result = tokio::time::timeout(Duration::from_secs(target.timeout), sent).await;
            peer.close().await;
            result.context("timed out waiting for the hub")??;
            Ok(())
        }
    }
}

impl Target {
    fn apply(&self, peer: &mut config::PeerSection) {
        if let Some(id) = &self.id {
            peer.id = id.clone();
        }
        if let Some(host) = &self.host {
            peer.host = host.clone();
        }
        if self.port.is_some() {
            peer.port = self.port;
        }
    }
}

async fn run_hub(config: hubrpc_core::HubConfig, ticks: Arc<dyn TickService>) -> Result<()> {
    let handler = Arc::new(BuiltinHub {
        hub: OnceLock::new(),
        ticks: ticks.clone(),
    });
    let hub = Hub::listen(config, handler.clone(), ticks).await?;
    let _ = handler.hub.set(hub.clone());
    info!(port = hub.bound_port(), session = %hub.session_id(), "hub ready");

    shutdown_signal().await?;
    info!("shutting down");
    hub.close().await;
    Ok(())
}

/// Hub with a few built-in methods for poking at peers from the command line.
struct BuiltinHub {
    hub: OnceLock<Hub>,
    ticks: Arc<dyn TickService>,
}

#[async_trait::async_trait]
impl HubHandler for BuiltinHub {
    async fn on_request(
        &self,
        peer: &LogicalId,
        method: &str,
        params: Value,
        responder: Responder,
    ) -> Result<()> {
        let hub = self.hub.get().context("hub not ready")?;
        let result = match method {
            "echo" => params,
            "time" => json!(self.ticks.now()),
            "peers" => json!(hub
                .peer_ids()
                .await
                .iter()
                .map(LogicalId::to_string)
                .collect::<Vec<_>>()),
            "ping-back" => hub.call(peer, "echo", params).await?,
            other => anyhow::bail!("unknown method {other}"),
        };
        responder.send(result).await;
        Ok(())
    }

    async fn on_peer_connected(&self, peer: &LogicalId) {
        info!(peer = %peer, "peer connected");
    }

    async fn on_peer_closed(&self, peer: &LogicalId, timed_out: bool) {
        info!(peer = %peer, timed_out, "peer gone");
    }

    async fn on_event(&self, peer: &LogicalId, body: Value) {
        info!(peer = %peer, body = %body, "event");
    }
}

/// Command-line peer: answers `echo` so the hub can call back.
struct CliPeer;

#[async_trait::async_trait]
impl PeerHandler for CliPeer {
    async fn on_request(&self, method: &str, params: Value, responder: Responder) -> Result<()> {
        match method {
            "echo" => {
                responder.send(params).await;
                Ok(())
            }
            other => anyhow::bail!("unknown method {other}"),
        }
    }

    async fn on_registered(&self, hub: &HubSessionId) {
        info!(hub = %hub, "registered");
    }

    async fn on_event(&self, body: Value) {
        info!(body = %body, "event from hub");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
