use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use eventmesh::{ConnectOptions, Event, EventBus, LocalBus, MeshNode, MeshOptions, Role};

/// Dial target given as `HOST:PORT`.
#[derive(Clone, Debug)]
struct Target {
    host: String,
    port: u16,
}

impl FromStr for Target {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .context("peer must be given as HOST:PORT")?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            anyhow::bail!("peer host must not be empty");
        }
        let port = port.parse().context("invalid peer port")?;
        Ok(Target {
            host: host.to_string(),
            port,
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "eventmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with mesh options (camelCase keys). Flags override it.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    /// Shared mesh secret.
    #[arg(short, long)]
    secret: Option<String>,

    /// PEM private key. Requires --cert.
    #[arg(long, value_name = "PATH", requires = "cert")]
    key: Option<PathBuf>,

    /// PEM certificate chain. Requires --key.
    #[arg(long, value_name = "PATH", requires = "key")]
    cert: Option<PathBuf>,

    /// Node role: peer, producer or consumer.
    #[arg(short, long)]
    role: Option<Role>,

    /// Event pattern a consumer subscribes to.
    #[arg(long)]
    pattern: Option<String>,

    /// JSON condition a consumer subscribes with.
    #[arg(long, value_name = "JSON")]
    condition: Option<String>,

    /// Peers to dial, as HOST:PORT.
    #[arg(short = 'C', long = "connect", value_name = "PEER")]
    connect: Vec<Target>,

    /// Require dialed peers to present a certificate chaining to ours.
    #[arg(long)]
    reject_unauthorized: bool,

    /// Heartbeat interval in milliseconds.
    #[arg(long, value_name = "MS")]
    heartbeat_interval: Option<u64>,
}

impl Args {
    fn options(&self) -> Result<MeshOptions> {
        let mut options = match &self.config {
            Some(path) => MeshOptions::from_toml_file(path)?,
            None => MeshOptions::default(),
        };

        if let Some(host) = &self.host {
            options.host = Some(host.clone());
        }
        if let Some(port) = self.port {
            options.port = Some(port);
        }
        if let Some(secret) = &self.secret {
            options.secret = Some(secret.clone());
        }
        if let (Some(key), Some(cert)) = (&self.key, &self.cert) {
            options.key = Some(key.clone());
            options.certificate = Some(cert.clone());
        }
        if let Some(role) = self.role {
            options.peer = role == Role::Peer;
            options.producer = role == Role::Producer;
            options.consumer = role == Role::Consumer;
        }
        if let Some(pattern) = &self.pattern {
            options.pattern = Some(pattern.clone());
        }
        if let Some(condition) = &self.condition {
            options.condition =
                Some(serde_json::from_str(condition).context("invalid --condition JSON")?);
        }
        if let Some(interval) = self.heartbeat_interval {
            options.heartbeat_interval = Some(interval);
        }
        Ok(options)
    }
}

/// Turn one stdin line (`TYPE [JSON]`) into an event.
fn parse_line(line: &str) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (kind, data) = match line.split_once(char::is_whitespace) {
        Some((kind, rest)) => {
            let rest = rest.trim();
            let data = serde_json::from_str(rest).unwrap_or_else(|_| Value::String(rest.to_string()));
            (kind, data)
        }
        None => (line, Value::Null),
    };
    Some(Event::new(kind, data))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let options = args.options()?;

    let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
    let mut events = bus.subscribe_all();
    let node = MeshNode::new(bus.clone());
    info!("Node identity: {}", node.identity());

    let config = node
        .configure(options)
        .await
        .context("failed to configure mesh")?;

    if config.role.can_listen() {
        let addr = node.start().await.context("failed to start listener")?;
        info!(%addr, "Listening for peers");
    }

    for target in &args.connect {
        let options = ConnectOptions::new(target.host.clone(), target.port)
            .reject_unauthorized(args.reject_unauthorized);
        match node.connect(options).await {
            Ok(conn) => {
                let peer = conn.peer().map(|p| p.identity).unwrap_or_default();
                info!(host = %target.host, port = target.port, %peer, "Connected");
            }
            Err(e) => {
                warn!(host = %target.host, port = target.port, error = %e, "Connect failed");
            }
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if event.source.as_deref() == Some(node.identity()) {
                    debug!(kind = %event.kind, data = %event.data, "mesh event");
                } else if event.origin != bus.id() {
                    info!(kind = %event.kind, origin = %event.origin, data = %event.data, "event received");
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Some(event) = parse_line(&line) {
                        let event = bus.emit(event);
                        debug!(id = %event.id, kind = %event.kind, "event emitted");
                    }
                }
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin read failed");
                    stdin_open = false;
                }
            },
        }
    }

    if let Err(e) = node.stop().await {
        warn!(error = %e, "Shutdown finished with errors");
    }
    node.quit().await;
    Ok(())
}
