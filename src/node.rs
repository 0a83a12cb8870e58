//! # Mesh Node Controller
//!
//! A [`MeshNode`] joins the local event bus of one process to the mesh. It
//! owns the configuration snapshot, the registry of live connections, the
//! listener and the heartbeat timer, all inside a single actor task; the
//! public handle is cheap to clone and talks to the actor over a command
//! channel.
//!
//! ## Quick Start
//!
//! ```ignore
//! let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
//! let node = MeshNode::new(bus.clone());
//!
//! node.configure(MeshOptions { secret: Some("shared".into()), ..Default::default() }).await?;
//! let addr = node.start().await?;
//!
//! // On another process
//! other.connect(ConnectOptions::new("10.0.0.1", addr.port())).await?;
//! ```
//!
//! ## Lifecycle Events
//!
//! | Event | When |
//! |-------|------|
//! | `mesh:server:starting` | `start` accepted, before binding |
//! | `mesh:server:started` | listener bound |
//! | `mesh:server:error` | configuration, role or bind failure |
//! | `mesh:peer:connecting` | `connect` dialing |
//! | `mesh:peer:heartbeat` | every heartbeat interval and on configure |
//!
//! Connection-level events (`connected`, `authenticated`, `disconnected`,
//! `error`) are published by each connection. All of them carry the node
//! identity as `source` and are never relayed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Interval, MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::config::{ConnectOptions, DEFAULT_CONNECT_HOST, MeshConfiguration, MeshOptions};
use crate::connection::{
    self, Connection, ConnectionContext, ConnectionEvent, ConnectionHandle, Direction, EVENT_PEER_ERROR,
    Stats, StatsSnapshot,
};
use crate::crypto;
use crate::error::{MeshError, MeshResult};

/// Bound on TCP connect plus TLS handshake, both directions.
/// SECURITY: an idle socket cannot hold an accept task forever.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const LISTEN_BACKLOG: u32 = 1024;
const COMMAND_CHANNEL_SIZE: usize = 64;
const CONNECTION_EVENT_CHANNEL_SIZE: usize = 256;

/// Pause after a failed `accept` (e.g. descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub const EVENT_PEER_CONNECTING: &str = "mesh:peer:connecting";
pub const EVENT_PEER_HEARTBEAT: &str = "mesh:peer:heartbeat";
pub const EVENT_SERVER_STARTING: &str = "mesh:server:starting";
pub const EVENT_SERVER_STARTED: &str = "mesh:server:started";
pub const EVENT_SERVER_ERROR: &str = "mesh:server:error";

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Configure(MeshOptions, oneshot::Sender<MeshResult<Arc<MeshConfiguration>>>),
    Connect(ConnectOptions, oneshot::Sender<MeshResult<ConnectionHandle>>),
    Start(oneshot::Sender<MeshResult<SocketAddr>>),
    Stop(oneshot::Sender<MeshResult<()>>),
    Connections(oneshot::Sender<Vec<ConnectionHandle>>),
    Configuration(oneshot::Sender<Option<Arc<MeshConfiguration>>>),
    LocalAddr(oneshot::Sender<Option<SocketAddr>>),
    Quit,
}

// ============================================================================
// MeshNode Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct MeshNode {
    identity: String,
    bus: Arc<dyn EventBus>,
    stats: Arc<Stats>,
    cmd_tx: mpsc::Sender<Command>,
}

impl MeshNode {
    /// Create an unconfigured node bound to `bus` and spawn its actor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        let identity = bus.unique_id();
        let stats = Arc::new(Stats::default());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::channel(CONNECTION_EVENT_CHANNEL_SIZE);

        let actor = NodeActor {
            identity: identity.clone(),
            bus: bus.clone(),
            stats: stats.clone(),
            context: None,
            connections: HashMap::new(),
            listener: None,
            heartbeat: None,
            events_tx,
        };
        tokio::spawn(actor.run(cmd_rx, events_rx));

        Self {
            identity,
            bus,
            stats,
            cmd_tx,
        }
    }

    /// Unique identity of this node, carried as `source` on lifecycle events.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Validate and apply options, replacing any previous configuration.
    ///
    /// Existing connections and a running listener keep the snapshot they
    /// were created with. The heartbeat restarts and fires immediately.
    pub async fn configure(&self, options: MeshOptions) -> MeshResult<Arc<MeshConfiguration>> {
        self.request(|tx| Command::Configure(options, tx)).await?
    }

    /// Dial a peer and resolve once the handshake completes.
    ///
    /// # Errors
    /// [`MeshError::NotConfigured`] before `configure`; TLS, transport and
    /// authentication failures otherwise.
    pub async fn connect(&self, options: ConnectOptions) -> MeshResult<ConnectionHandle> {
        self.request(|tx| Command::Connect(options, tx)).await?
    }

    /// Begin accepting inbound connections. Returns the bound address.
    ///
    /// # Errors
    /// Fails when unconfigured, when the role is not `peer`, when already
    /// listening, or when the address cannot be bound.
    pub async fn start(&self) -> MeshResult<SocketAddr> {
        self.request(Command::Start).await?
    }

    /// Close every tracked connection, wait for all of them, then close the
    /// listener.
    pub async fn stop(&self) -> MeshResult<()> {
        self.request(Command::Stop).await?
    }

    pub async fn connections(&self) -> MeshResult<Vec<ConnectionHandle>> {
        self.request(Command::Connections).await
    }

    pub async fn configuration(&self) -> MeshResult<Option<Arc<MeshConfiguration>>> {
        self.request(Command::Configuration).await
    }

    pub async fn local_addr(&self) -> MeshResult<Option<SocketAddr>> {
        self.request(Command::LocalAddr).await
    }

    /// Stop the actor. Live connections are left to finish on their own.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(tx))
            .await
            .map_err(|_| MeshError::Shutdown)?;
        rx.await.map_err(|_| MeshError::Shutdown)
    }
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("identity", &self.identity)
            .field("bus", &self.bus.id())
            .finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Listener {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct NodeActor {
    identity: String,
    bus: Arc<dyn EventBus>,
    stats: Arc<Stats>,
    /// Present once configured.
    context: Option<Arc<ConnectionContext>>,
    connections: HashMap<String, ConnectionHandle>,
    listener: Option<Listener>,
    heartbeat: Option<Interval>,
    events_tx: mpsc::Sender<ConnectionEvent>,
}

impl NodeActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut events_rx: mpsc::Receiver<ConnectionEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Configure(options, reply)) => {
                        let _ = reply.send(self.configure(options));
                    }
                    Some(Command::Connect(options, reply)) => self.connect(options, reply),
                    Some(Command::Start(reply)) => {
                        let _ = reply.send(self.start().await);
                    }
                    Some(Command::Stop(reply)) => self.stop(reply),
                    Some(Command::Connections(reply)) => {
                        let _ = reply.send(self.connections.values().cloned().collect());
                    }
                    Some(Command::Configuration(reply)) => {
                        let _ = reply.send(self.context.as_ref().map(|ctx| ctx.config.clone()));
                    }
                    Some(Command::LocalAddr(reply)) => {
                        let _ = reply.send(self.listener.as_ref().map(|l| l.addr));
                    }
                    Some(Command::Quit) => {
                        debug!(node = %self.identity, "mesh actor quitting");
                        break;
                    }
                    None => {
                        debug!(node = %self.identity, "mesh handle dropped, actor quitting");
                        break;
                    }
                },
                Some(event) = events_rx.recv() => self.track(event),
                _ = next_heartbeat(&mut self.heartbeat) => self.heartbeat(),
            }
        }

        if let Some(listener) = self.listener.take() {
            let _ = listener.shutdown.send(());
        }
    }

    fn track(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened(handle) => {
                debug!(node = %self.identity, conn = %handle.id(), direction = %handle.direction(), "tracking connection");
                self.connections.insert(handle.id().to_string(), handle);
            }
            ConnectionEvent::Closed(id) => {
                if self.connections.remove(&id).is_some() {
                    debug!(node = %self.identity, conn = %id, "connection untracked");
                }
            }
        }
    }

    fn publish(&self, kind: &str, data: Value) {
        self.bus
            .emit(Event::new(kind, data).with_source(self.identity.clone()));
    }

    fn fail<T>(&self, error: MeshError) -> MeshResult<T> {
        warn!(node = %self.identity, error = %error, "mesh operation failed");
        self.publish(EVENT_SERVER_ERROR, json!({ "error": error.to_string() }));
        Err(error)
    }

    fn configure(&mut self, options: MeshOptions) -> MeshResult<Arc<MeshConfiguration>> {
        let bus = self.bus.clone();
        let config = match MeshConfiguration::resolve(options, || bus.unique_id()) {
            Ok(config) => Arc::new(config),
            Err(e) => return self.fail(e),
        };

        self.context = Some(Arc::new(ConnectionContext {
            identity: self.identity.clone(),
            bus: self.bus.clone(),
            config: config.clone(),
            stats: self.stats.clone(),
            events: self.events_tx.clone(),
        }));

        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);

        info!(
            node = %self.identity,
            role = %config.role,
            host = %config.host,
            port = config.port,
            algorithm = %config.algorithm,
            "mesh configured"
        );
        Ok(config)
    }

    fn heartbeat(&self) {
        let Some(ctx) = &self.context else {
            return;
        };
        self.publish(
            EVENT_PEER_HEARTBEAT,
            json!({
                "identity": self.identity,
                "bus": self.bus.id(),
                "node": ctx.config.role,
                "stats": self.stats.snapshot(),
                "connections": self.connections.len(),
            }),
        );
    }

    fn connect(&self, options: ConnectOptions, reply: oneshot::Sender<MeshResult<ConnectionHandle>>) {
        let Some(ctx) = self.context.clone() else {
            let _ = reply.send(self.fail(MeshError::NotConfigured));
            return;
        };

        let host = options
            .host
            .clone()
            .unwrap_or_else(|| DEFAULT_CONNECT_HOST.to_string());
        let port = options.port.unwrap_or(ctx.config.port);
        let secret = options
            .secret
            .clone()
            .unwrap_or_else(|| ctx.config.secret().to_string());
        let reject_unauthorized = options.reject_unauthorized.unwrap_or(false);

        debug!(node = %self.identity, %host, port, reject_unauthorized, "dialing peer");
        self.publish(
            EVENT_PEER_CONNECTING,
            json!({ "host": host, "port": port, "rejectUnauthorized": reject_unauthorized }),
        );

        tokio::spawn(async move {
            let result = dial(ctx, &host, port, secret, reject_unauthorized).await;
            if let Err(e) = &result {
                debug!(%host, port, error = %e, "dial failed");
            }
            let _ = reply.send(result);
        });
    }

    async fn start(&mut self) -> MeshResult<SocketAddr> {
        let Some(ctx) = self.context.clone() else {
            return self.fail(MeshError::NotConfigured);
        };
        if !ctx.config.role.can_listen() {
            return self.fail(MeshError::ListenerRole(ctx.config.role));
        }
        if let Some(listener) = &self.listener {
            return self.fail(MeshError::AlreadyListening(listener.addr));
        }

        self.publish(EVENT_SERVER_STARTING, ctx.config.summary());

        let bind_addr = ctx.config.bind_addr();
        let listener = match bind(&bind_addr, ctx.config.keep_alive).await {
            Ok(listener) => listener,
            Err(source) => {
                return self.fail(MeshError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));
        self.listener = Some(Listener { addr, shutdown, task });

        info!(node = %self.identity, %addr, "mesh listening");
        self.publish(EVENT_SERVER_STARTED, json!({ "address": addr.to_string() }));
        Ok(addr)
    }

    fn stop(&mut self, reply: oneshot::Sender<MeshResult<()>>) {
        let handles = self.connections.values().cloned().collect::<Vec<_>>();
        let listener = self.listener.take();
        debug!(node = %self.identity, connections = handles.len(), "stopping mesh");

        tokio::spawn(async move {
            let mut closing = JoinSet::new();
            for handle in handles {
                closing.spawn(async move { handle.close().await });
            }

            let mut result = Ok(());
            while let Some(joined) = closing.join_next().await {
                match joined {
                    Ok(Err(e)) => {
                        warn!(error = %e, "connection closed with error");
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                    Err(e) => warn!(error = %e, "close task failed"),
                    Ok(Ok(())) => {}
                }
            }

            if let Some(listener) = listener {
                let _ = listener.shutdown.send(());
                let _ = listener.task.await;
                debug!(addr = %listener.addr, "listener closed");
            }
            let _ = reply.send(result);
        });
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ============================================================================
// Listener and Dialer
// ============================================================================

async fn bind(addr: &str, keep_alive: bool) -> std::io::Result<TcpListener> {
    let addr = lookup_host(addr).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "host resolved to no address")
    })?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(keep_alive)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = accept(stream, remote, ctx.clone()).await {
                            debug!(%remote, error = %e, "inbound connection rejected");
                            ctx.publish(
                                EVENT_PEER_ERROR,
                                json!({ "remote": remote.to_string(), "direction": Direction::Server, "error": e.to_string() }),
                            );
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn accept(stream: TcpStream, remote: SocketAddr, ctx: Arc<ConnectionContext>) -> MeshResult<()> {
    stream.set_nodelay(true)?;
    let tls = timeout(TLS_HANDSHAKE_TIMEOUT, ctx.config.acceptor().accept(stream))
        .await
        .map_err(|_| MeshError::Tls("TLS handshake timed out".into()))?
        .map_err(|e| MeshError::Tls(e.to_string()))?;

    let secret = ctx.config.secret().to_string();
    let (handle, connection) = Connection::new(tls, Direction::Server, Some(remote), ctx, secret, None);
    connection::launch(connection, handle).await;
    Ok(())
}

async fn dial(
    ctx: Arc<ConnectionContext>,
    host: &str,
    port: u16,
    secret: String,
    reject_unauthorized: bool,
) -> MeshResult<ConnectionHandle> {
    let connector = ctx
        .config
        .tls()
        .connector(reject_unauthorized)
        .map_err(|e| MeshError::Tls(format!("{e:#}")))?;
    let server_name = crypto::server_name(host)?;

    let connected = timeout(TLS_HANDSHAKE_TIMEOUT, async {
        let addr = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| MeshError::Transport(format!("{host} resolved to no address")))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(ctx.config.keep_alive)?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| MeshError::Tls(e.to_string()))?;
        Ok::<_, MeshError>((addr, tls))
    })
    .await
    .map_err(|_| MeshError::Transport(format!("connecting to {host}:{port} timed out")))?;

    let (addr, tls) = match connected {
        Ok(connected) => connected,
        Err(e) => {
            ctx.publish(
                EVENT_PEER_ERROR,
                json!({ "host": host, "port": port, "direction": Direction::Client, "error": e.to_string() }),
            );
            return Err(e);
        }
    };

    let (ready_tx, ready_rx) = oneshot::channel();
    let (handle, connection) =
        Connection::new(tls, Direction::Client, Some(addr), ctx, secret, Some(ready_tx));
    connection::launch(connection, handle).await;
    ready_rx.await.map_err(|_| MeshError::Shutdown)?
}
