//! # Mesh Connection
//!
//! One TLS stream plus its authentication and relay state machine. Each
//! connection runs as its own actor task with a companion frame-reader task;
//! the public [`ConnectionHandle`] is a cheap clone that observes state and
//! requests closure.
//!
//! ## Lifecycle
//!
//! ```text
//! authenticating ──(server sends challenge)──> challenge
//!        │                                        │
//!        └──────────────> authenticated <─────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              v               v               v
//!           closed           error           failed
//! ```
//!
//! | State | Meaning |
//! |-------|---------|
//! | `authenticating` | transport up, handshake not finished |
//! | `challenge` | server has issued its sealed nonce |
//! | `authenticated` | both descriptors exchanged, relay attached |
//! | `closed` | clean shutdown after authentication |
//! | `error` | transport failure after authentication |
//! | `failed` | terminated before authentication completed |
//!
//! ## Handshake
//!
//! | Step | Direction | Message |
//! |------|-----------|---------|
//! | 1 | server → client | `challenge`: enc(nonce_S) |
//! | 2 | client → server | `counter`: nonce_S, enc(nonce_C) |
//! | 3 | server → client | `response`: nonce_C |
//! | 4 | client → server | `authenticated`: client descriptor |
//! | 5 | server → client | `authenticated`: server descriptor |
//!
//! Any message out of order for the current step terminates the connection.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, trace, warn};

use crate::bus::{Event, EventBus, EventFilter, Subscription};
use crate::config::{MeshConfiguration, Role};
use crate::crypto;
use crate::error::{MeshError, MeshResult};
use crate::messages::{self, Message, PROTOCOL_VERSION, PeerDescriptor};
use crate::seen::Seen;

/// How long a closing connection waits for the peer to confirm closure.
pub const CLOSE_LINGER: Duration = Duration::from_secs(5);

/// Bound on writing one frame, and on the final shutdown of the write half.
/// A peer that stops reading for longer breaks the link.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const COMMAND_CHANNEL_SIZE: usize = 16;
const INBOUND_CHANNEL_SIZE: usize = 64;

pub const EVENT_PEER_CONNECTED: &str = "mesh:peer:connected";
pub const EVENT_PEER_AUTHENTICATED: &str = "mesh:peer:authenticated";
pub const EVENT_PEER_DISCONNECTED: &str = "mesh:peer:disconnected";
pub const EVENT_PEER_ERROR: &str = "mesh:peer:error";

// ============================================================================
// Public Types
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Accepted by the local listener.
    Server,
    /// Dialed by the local node.
    Client,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Server => "server",
            Direction::Client => "client",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Authenticating,
    Challenge,
    Authenticated,
    Closed,
    Error,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Error | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticating => "authenticating",
            Self::Challenge => "challenge",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay counters for one node, shared by all of its connections.
#[derive(Debug, Default)]
pub struct Stats {
    received: AtomicU64,
    transmitted: AtomicU64,
}

impl Stats {
    /// Inbound events delivered to the local bus.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Local events sent to peers.
    pub fn transmitted(&self) -> u64 {
        self.transmitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received(),
            transmitted: self.transmitted(),
        }
    }

    fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn record_transmitted(&self) {
        self.transmitted.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub transmitted: u64,
}

/// Node-wide state every connection of one controller shares.
pub(crate) struct ConnectionContext {
    pub identity: String,
    pub bus: Arc<dyn EventBus>,
    pub config: Arc<MeshConfiguration>,
    pub stats: Arc<Stats>,
    pub events: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionContext {
    fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            identity: self.identity.clone(),
            bus: self.bus.id().to_string(),
            node: self.config.role,
            pattern: self.config.pattern.clone(),
            condition: self.config.condition.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
        }
    }

    /// Publish a lifecycle event. The node identity as `source` keeps it
    /// out of every relay.
    pub(crate) fn publish(&self, kind: &str, data: Value) {
        self.bus
            .emit(Event::new(kind, data).with_source(self.identity.clone()));
    }
}

/// Registry notifications sent to the controller.
pub(crate) enum ConnectionEvent {
    Opened(ConnectionHandle),
    Closed(String),
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Close(oneshot::Sender<MeshResult<()>>),
}

struct Shared {
    peer: OnceLock<PeerDescriptor>,
    connected: AtomicBool,
}

/// Public view of a running connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: String,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    state: watch::Receiver<ConnectionState>,
    shared: Arc<Shared>,
    cmd_tx: mpsc::Sender<Command>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Descriptor the remote node announced. `None` until authenticated.
    pub fn peer(&self) -> Option<PeerDescriptor> {
        self.shared.peer.get().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state() == ConnectionState::Authenticated
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Close the connection and wait until the peer confirms (or the linger
    /// expires). Resolves immediately if already disconnected.
    ///
    /// A peer that has stopped reading cannot hold this past
    /// [`WRITE_TIMEOUT`] plus [`CLOSE_LINGER`].
    ///
    /// # Errors
    /// [`MeshError::Transport`] when the connection ended in `error`.
    pub async fn close(&self) -> MeshResult<()> {
        if self.is_connected() {
            let (tx, rx) = oneshot::channel();
            if self.cmd_tx.send(Command::Close(tx)).await.is_ok()
                && let Ok(result) = rx.await
            {
                return result;
            }
        }
        // Already finished, or finished before it saw the request.
        match self.terminated().await {
            ConnectionState::Error => Err(MeshError::Transport("connection ended in error".into())),
            _ => Ok(()),
        }
    }

    /// Wait until the handshake completes.
    ///
    /// # Errors
    /// [`MeshError::ClosedBeforeAuthentication`] when the connection
    /// terminated first.
    pub async fn authenticated(&self) -> MeshResult<()> {
        let state = self.wait_for(|s| s == ConnectionState::Authenticated || s.is_terminal()).await;
        if state == ConnectionState::Authenticated {
            Ok(())
        } else {
            Err(MeshError::ClosedBeforeAuthentication)
        }
    }

    /// Wait until the connection reaches a terminal state.
    pub async fn terminated(&self) -> ConnectionState {
        self.wait_for(ConnectionState::is_terminal).await
    }

    async fn wait_for(&self, done: impl Fn(ConnectionState) -> bool) -> ConnectionState {
        let mut rx = self.state.clone();
        let reached = rx.wait_for(|s| done(*s)).await.map(|state| *state);
        match reached {
            Ok(state) => state,
            Err(_) => *rx.borrow(),
        }
    }

    /// Secret-free summary for lifecycle events.
    pub fn describe(&self) -> Value {
        json!({
            "id": self.id,
            "direction": self.direction,
            "remote": self.remote_addr.map(|a| a.to_string()),
            "state": self.state(),
            "peer": self.peer(),
        })
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Actor
// ============================================================================

enum Inbound {
    Message(Message),
    Malformed(MeshError),
    Eof,
    Failed(MeshError),
}

/// Why the main loop stopped.
enum Exit {
    /// Peer closed its side.
    RemoteClosed,
    /// Local close request or handshake termination; wait for the peer.
    Closing(Option<MeshError>),
    /// The stream is unusable.
    Broken(MeshError),
}

pub(crate) struct Connection<S> {
    id: String,
    direction: Direction,
    remote_addr: Option<SocketAddr>,
    ctx: Arc<ConnectionContext>,
    secret: String,

    reader: Option<ReadHalf<S>>,
    writer: WriteHalf<S>,
    cmd_rx: mpsc::Receiver<Command>,
    state: watch::Sender<ConnectionState>,
    shared: Arc<Shared>,

    /// Nonce this side issued and expects echoed back.
    challenge: Option<String>,
    /// Client: counter sent.
    answered: bool,
    /// Server: counter verified. Client: response verified.
    verified: bool,

    seen: Seen,
    relay: Option<Subscription>,
    handle: Option<ConnectionHandle>,
    on_connect: Option<oneshot::Sender<MeshResult<ConnectionHandle>>>,
    close_waiters: Vec<oneshot::Sender<MeshResult<()>>>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(
        stream: S,
        direction: Direction,
        remote_addr: Option<SocketAddr>,
        ctx: Arc<ConnectionContext>,
        secret: String,
        on_connect: Option<oneshot::Sender<MeshResult<ConnectionHandle>>>,
    ) -> (ConnectionHandle, Self) {
        let id = ctx.bus.unique_id();
        let (reader, writer) = tokio::io::split(stream);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Authenticating);
        let shared = Arc::new(Shared {
            peer: OnceLock::new(),
            connected: AtomicBool::new(true),
        });

        let handle = ConnectionHandle {
            id: id.clone(),
            direction,
            remote_addr,
            state: state_rx,
            shared: shared.clone(),
            cmd_tx,
        };

        let connection = Self {
            id,
            direction,
            remote_addr,
            ctx,
            secret,
            reader: Some(reader),
            writer,
            cmd_rx,
            state: state_tx,
            shared,
            challenge: None,
            answered: false,
            verified: false,
            seen: Seen::default(),
            relay: None,
            handle: on_connect.as_ref().map(|_| handle.clone()),
            on_connect,
            close_waiters: Vec::new(),
        };

        (handle, connection)
    }

    pub(crate) async fn run(mut self) {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let reader_task = self
            .reader
            .take()
            .map(|reader| tokio::spawn(read_loop(reader, inbound_tx)));

        debug!(conn = %self.id, direction = %self.direction, remote = ?self.remote_addr, "connection opened");
        self.ctx.publish(EVENT_PEER_CONNECTED, self.describe(None));

        let deadline = self
            .ctx
            .config
            .handshake_timeout
            .map(|timeout| Instant::now() + timeout);

        let exit = match self.open().await {
            Err(e) => Exit::Closing(Some(e)),
            Ok(()) => loop {
                tokio::select! {
                    inbound = inbound_rx.recv() => match inbound {
                        Some(Inbound::Message(message)) => {
                            if let Err(e) = self.handle_message(message).await {
                                break self.exit_for(e);
                            }
                        }
                        Some(Inbound::Malformed(e)) => {
                            warn!(conn = %self.id, error = %e, "malformed message");
                            self.ctx.publish(EVENT_PEER_ERROR, self.describe(Some(&e)));
                            if !self.is_authenticated() {
                                break Exit::Closing(Some(e));
                            }
                        }
                        Some(Inbound::Failed(e)) => break Exit::Broken(e),
                        Some(Inbound::Eof) | None => break Exit::RemoteClosed,
                    },
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(Command::Close(reply)) => {
                            self.close_waiters.push(reply);
                            break Exit::Closing(None);
                        }
                        None => break Exit::Closing(None),
                    },
                    event = next_relay(&mut self.relay) => match event {
                        Some(event) => {
                            if let Err(e) = self.relay(&event).await {
                                break Exit::Broken(e);
                            }
                        }
                        None => self.relay = None,
                    },
                    _ = handshake_deadline(deadline), if !self.is_authenticated() => {
                        break Exit::Closing(Some(MeshError::Authentication(
                            "handshake timed out".into(),
                        )));
                    }
                }
            },
        };

        let reason = match exit {
            Exit::RemoteClosed => {
                self.shutdown_writer().await;
                None
            }
            Exit::Closing(reason) => {
                self.shutdown_writer().await;
                self.linger(&mut inbound_rx).await;
                reason
            }
            // Nothing more can be written; dropping both halves drops the socket.
            Exit::Broken(e) => Some(e),
        };

        if let Some(task) = reader_task {
            task.abort();
        }
        self.finish(reason).await;
    }

    /// Server side opens the handshake.
    async fn open(&mut self) -> MeshResult<()> {
        if self.direction != Direction::Server {
            return Ok(());
        }
        let nonce = crypto::generate_challenge(self.ctx.config.challenge_size);
        let sealed = crypto::encrypt(self.ctx.config.algorithm, &nonce, &self.secret)?;
        self.challenge = Some(nonce);
        self.send(&Message::Challenge { challenge: sealed }).await?;
        self.set_state(ConnectionState::Challenge);
        trace!(conn = %self.id, "challenge issued");
        Ok(())
    }

    fn exit_for(&self, error: MeshError) -> Exit {
        match error {
            MeshError::Io(_) | MeshError::Transport(_) => Exit::Broken(error),
            other => Exit::Closing(Some(other)),
        }
    }

    /// Wait for the peer to confirm closure, collecting further close
    /// requests meanwhile.
    async fn linger(&mut self, inbound_rx: &mut mpsc::Receiver<Inbound>) {
        let until = Instant::now() + CLOSE_LINGER;
        loop {
            tokio::select! {
                inbound = inbound_rx.recv() => match inbound {
                    Some(Inbound::Message(_)) | Some(Inbound::Malformed(_)) => continue,
                    _ => return,
                },
                Some(Command::Close(reply)) = self.cmd_rx.recv() => {
                    self.close_waiters.push(reply);
                }
                _ = tokio::time::sleep_until(until) => {
                    debug!(conn = %self.id, "close linger expired");
                    return;
                }
            }
        }
    }

    async fn finish(mut self, reason: Option<MeshError>) {
        while let Ok(Command::Close(reply)) = self.cmd_rx.try_recv() {
            self.close_waiters.push(reply);
        }

        let state = match (self.is_authenticated(), &reason) {
            (false, _) => ConnectionState::Failed,
            (true, Some(_)) => ConnectionState::Error,
            (true, None) => ConnectionState::Closed,
        };
        self.relay = None;
        self.shared.connected.store(false, Ordering::Release);
        self.set_state(state);

        match &reason {
            Some(e) => {
                warn!(conn = %self.id, state = %state, error = %e, "connection terminated");
                self.ctx.publish(EVENT_PEER_ERROR, self.describe(Some(e)));
            }
            None => debug!(conn = %self.id, state = %state, "connection closed"),
        }
        self.ctx.publish(EVENT_PEER_DISCONNECTED, self.describe(None));

        let waiter_result = || match (&reason, state) {
            (Some(e), ConnectionState::Error) => Err(MeshError::Transport(e.to_string())),
            _ => Ok(()),
        };
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(waiter_result());
        }

        if let Some(on_connect) = self.on_connect.take() {
            let _ = on_connect.send(Err(reason.unwrap_or(MeshError::ClosedBeforeAuthentication)));
        }

        let _ = self.ctx.events.send(ConnectionEvent::Closed(self.id.clone())).await;
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    async fn handle_message(&mut self, message: Message) -> MeshResult<()> {
        if self.is_authenticated() {
            return match message {
                Message::Event(event) => {
                    self.receive_event(event);
                    Ok(())
                }
                other => {
                    debug!(conn = %self.id, object = other.kind(), "ignoring handshake message after authentication");
                    Ok(())
                }
            };
        }

        let state = self.current_state();
        match (self.direction, message) {
            (Direction::Client, Message::Challenge { challenge })
                if state == ConnectionState::Authenticating && !self.answered =>
            {
                self.on_challenge(&challenge).await
            }
            (Direction::Server, Message::Counter { answer, counter })
                if state == ConnectionState::Challenge && !self.verified =>
            {
                self.on_counter(&answer, &counter).await
            }
            (Direction::Client, Message::Response { answer }) if self.answered && !self.verified => {
                self.on_response(&answer).await
            }
            (Direction::Server, Message::Authenticated(peer)) if self.verified => {
                self.authenticate(peer)?;
                self.send(&Message::Authenticated(self.ctx.descriptor())).await
            }
            (Direction::Client, Message::Authenticated(peer)) if self.verified => {
                self.authenticate(peer)?;
                if let Some(on_connect) = self.on_connect.take()
                    && let Some(handle) = self.handle.take()
                {
                    let _ = on_connect.send(Ok(handle));
                }
                Ok(())
            }
            (direction, other) => Err(MeshError::Protocol(format!(
                "unexpected {} message in state {state} as {direction}",
                other.kind()
            ))),
        }
    }

    async fn on_challenge(&mut self, challenge: &str) -> MeshResult<()> {
        let answer = crypto::decrypt(self.ctx.config.algorithm, challenge, &self.secret)
            .map_err(|e| MeshError::Authentication(format!("cannot open challenge: {e}")))?;

        let nonce = crypto::generate_challenge(self.ctx.config.challenge_size);
        let counter = crypto::encrypt(self.ctx.config.algorithm, &nonce, &self.secret)?;
        self.challenge = Some(nonce);
        self.answered = true;
        self.send(&Message::Counter { answer, counter }).await
    }

    async fn on_counter(&mut self, answer: &str, counter: &str) -> MeshResult<()> {
        let expected = self.challenge.as_deref().unwrap_or_default();
        if !crypto::challenge_matches(expected, answer) {
            return Err(MeshError::Authentication("challenge answer mismatch".into()));
        }
        let counter = crypto::decrypt(self.ctx.config.algorithm, counter, &self.secret)
            .map_err(|e| MeshError::Authentication(format!("cannot open counter challenge: {e}")))?;

        self.verified = true;
        self.send(&Message::Response { answer: counter }).await
    }

    async fn on_response(&mut self, answer: &str) -> MeshResult<()> {
        let expected = self.challenge.as_deref().unwrap_or_default();
        if !crypto::challenge_matches(expected, answer) {
            return Err(MeshError::Authentication("counter answer mismatch".into()));
        }
        self.verified = true;
        self.send(&Message::Authenticated(self.ctx.descriptor())).await
    }

    fn authenticate(&mut self, peer: PeerDescriptor) -> MeshResult<()> {
        if peer.protocol != PROTOCOL_VERSION {
            return Err(MeshError::Protocol(format!(
                "peer speaks protocol {}, expected {PROTOCOL_VERSION}",
                peer.protocol
            )));
        }

        self.attach_relay(&peer);
        info!(
            conn = %self.id,
            direction = %self.direction,
            peer = %peer.identity,
            role = %peer.node,
            "peer authenticated"
        );
        let _ = self.shared.peer.set(peer);
        self.set_state(ConnectionState::Authenticated);
        self.ctx.publish(EVENT_PEER_AUTHENTICATED, self.describe(None));
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    fn attach_relay(&mut self, peer: &PeerDescriptor) {
        if !self.ctx.config.role.relays_outbound() {
            return;
        }
        self.relay = match peer.node {
            Role::Peer => Some(self.ctx.bus.subscribe_all()),
            Role::Consumer => match EventFilter::new(&peer.pattern, Some(&peer.condition)) {
                Ok(filter) => Some(self.ctx.bus.subscribe(filter)),
                Err(e) => {
                    warn!(conn = %self.id, error = %e, "consumer subscription rejected, not relaying");
                    None
                }
            },
            Role::Producer => None,
        };
    }

    fn receive_event(&mut self, event: Event) {
        if event.id.is_empty() || event.origin.is_empty() {
            let e = MeshError::Malformed("event without id or origin".into());
            warn!(conn = %self.id, error = %e, "dropping event");
            self.ctx.publish(EVENT_PEER_ERROR, self.describe(Some(&e)));
            return;
        }
        if !self.ctx.config.role.delivers_inbound() {
            trace!(conn = %self.id, id = %event.id, "producer drops inbound event");
            return;
        }
        if self.seen.has(&event.id) || event.origin == self.ctx.bus.id() {
            trace!(conn = %self.id, id = %event.id, "duplicate event");
            return;
        }

        self.seen.add(&event.id);
        self.ctx.stats.record_received();
        trace!(conn = %self.id, id = %event.id, kind = %event.kind, "event received");
        self.ctx.bus.emit(event);
    }

    async fn relay(&mut self, event: &Event) -> MeshResult<()> {
        let Some(peer) = self.shared.peer.get() else {
            return Ok(());
        };
        if event.source.as_deref() == Some(self.ctx.identity.as_str())
            || event.origin == peer.bus
            || self.seen.has(&event.id)
        {
            return Ok(());
        }

        self.seen.add(&event.id);
        self.send(&Message::event(event)).await?;
        self.ctx.stats.record_transmitted();
        trace!(conn = %self.id, id = %event.id, kind = %event.kind, "event relayed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn send(&mut self, message: &Message) -> MeshResult<()> {
        match timeout(WRITE_TIMEOUT, messages::write_message(&mut self.writer, message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(MeshError::Io(io))) => Err(MeshError::Transport(io.to_string())),
            Ok(Err(other)) => Err(other),
            Err(_) => Err(MeshError::Transport(format!(
                "peer stopped reading, write stalled for {WRITE_TIMEOUT:?}"
            ))),
        }
    }

    async fn shutdown_writer(&mut self) {
        if timeout(WRITE_TIMEOUT, self.writer.shutdown()).await.is_err() {
            debug!(conn = %self.id, "shutdown of write half timed out");
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn is_authenticated(&self) -> bool {
        self.current_state() == ConnectionState::Authenticated
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn describe(&self, error: Option<&MeshError>) -> Value {
        let mut data = json!({
            "id": self.id,
            "direction": self.direction,
            "remote": self.remote_addr.map(|a| a.to_string()),
            "state": self.current_state(),
            "peer": self.shared.peer.get(),
        });
        if let Some(e) = error {
            data["error"] = Value::String(e.to_string());
        }
        data
    }
}

async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let inbound = match messages::read_frame(&mut reader).await {
            Ok(Some(payload)) => match messages::decode(&payload) {
                Ok(message) => Inbound::Message(message),
                Err(e) => Inbound::Malformed(e),
            },
            Ok(None) => Inbound::Eof,
            Err(MeshError::Io(e)) => Inbound::Failed(MeshError::Transport(e.to_string())),
            Err(e) => Inbound::Failed(e),
        };
        let done = matches!(inbound, Inbound::Eof | Inbound::Failed(_));
        if tx.send(inbound).await.is_err() || done {
            break;
        }
    }
}

async fn next_relay(relay: &mut Option<Subscription>) -> Option<Arc<Event>> {
    match relay {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn handshake_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Spawn a connection's actor after announcing it to the controller, so the
/// controller always sees `Opened` before `Closed`.
pub(crate) async fn launch<S>(connection: Connection<S>, handle: ConnectionHandle)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let _ = connection
        .ctx
        .events
        .send(ConnectionEvent::Opened(handle))
        .await;
    tokio::spawn(connection.run());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::MeshOptions;
    use crate::messages::MAX_FRAME_SIZE;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    const SECRET: &str = "bc6383f0-b6e7-11e9-9f74-0348351cafd3";
    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    struct Side {
        ctx: Arc<ConnectionContext>,
        _events: mpsc::Receiver<ConnectionEvent>,
    }

    fn side(options: MeshOptions) -> Side {
        let bus: Arc<dyn EventBus> = Arc::new(LocalBus::new());
        let config = MeshConfiguration::resolve(options, || SECRET.to_string()).expect("config");
        let (events, rx) = mpsc::channel(64);
        Side {
            ctx: Arc::new(ConnectionContext {
                identity: bus.unique_id(),
                bus,
                config: Arc::new(config),
                stats: Arc::new(Stats::default()),
                events,
            }),
            _events: rx,
        }
    }

    fn peer() -> Side {
        side(MeshOptions::default())
    }

    fn spawn_server(server: &Side, stream: DuplexStream) -> ConnectionHandle {
        let (handle, connection) = Connection::new(
            stream,
            Direction::Server,
            None,
            server.ctx.clone(),
            server.ctx.config.secret().to_string(),
            None,
        );
        tokio::spawn(connection.run());
        handle
    }

    fn spawn_client(
        client: &Side,
        stream: DuplexStream,
        secret: &str,
    ) -> (ConnectionHandle, oneshot::Receiver<MeshResult<ConnectionHandle>>) {
        let (tx, rx) = oneshot::channel();
        let (handle, connection) = Connection::new(
            stream,
            Direction::Client,
            None,
            client.ctx.clone(),
            secret.to_string(),
            Some(tx),
        );
        tokio::spawn(connection.run());
        (handle, rx)
    }

    /// Run a full handshake between two sides; returns (server, client).
    async fn connect(server: &Side, client: &Side) -> (ConnectionHandle, ConnectionHandle) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server_handle = spawn_server(server, a);
        let (_, ready) = spawn_client(client, b, SECRET);
        let client_handle = timeout(TEST_TIMEOUT, ready)
            .await
            .expect("handshake timed out")
            .expect("connect dropped")
            .expect("handshake failed");
        timeout(TEST_TIMEOUT, server_handle.authenticated())
            .await
            .expect("server timed out")
            .expect("server failed");
        (server_handle, client_handle)
    }

    async fn read_message(stream: &mut DuplexStream) -> Option<Message> {
        let payload = messages::read_frame(stream).await.ok()??;
        messages::decode(&payload).ok()
    }

    async fn next_of_kind(sub: &mut Subscription) -> Arc<Event> {
        timeout(TEST_TIMEOUT, sub.recv())
            .await
            .expect("no event within timeout")
            .expect("bus closed")
    }

    /// Drive the client half of the handshake by hand against a server
    /// connection.
    async fn manual_client(stream: &mut DuplexStream, bus: &str) -> PeerDescriptor {
        let algorithm = crypto::CipherAlgorithm::default();
        let Some(Message::Challenge { challenge }) = read_message(stream).await else {
            panic!("expected challenge");
        };
        let answer = crypto::decrypt(algorithm, &challenge, SECRET).unwrap();
        let nonce = crypto::generate_challenge(32);
        let counter = crypto::encrypt(algorithm, &nonce, SECRET).unwrap();
        messages::write_message(stream, &Message::Counter { answer, counter })
            .await
            .unwrap();

        let Some(Message::Response { answer }) = read_message(stream).await else {
            panic!("expected response");
        };
        assert_eq!(answer, nonce);

        let descriptor = PeerDescriptor {
            identity: "manual".into(),
            bus: bus.into(),
            node: Role::Peer,
            pattern: "*".into(),
            condition: Value::Null,
            version: String::new(),
            protocol: PROTOCOL_VERSION,
        };
        messages::write_message(stream, &Message::Authenticated(descriptor))
            .await
            .unwrap();

        let Some(Message::Authenticated(server)) = read_message(stream).await else {
            panic!("expected server descriptor");
        };
        server
    }

    #[tokio::test]
    async fn handshake_exchanges_descriptors() {
        let server = peer();
        let client = side(MeshOptions {
            consumer: true,
            pattern: Some("sensor:*".into()),
            ..Default::default()
        });
        let (server_conn, client_conn) = connect(&server, &client).await;

        assert!(server_conn.is_authenticated());
        assert!(client_conn.is_authenticated());
        assert_eq!(server_conn.direction(), Direction::Server);
        assert_eq!(client_conn.direction(), Direction::Client);

        let seen_by_server = server_conn.peer().unwrap();
        assert_eq!(seen_by_server.bus, client.ctx.bus.id());
        assert_eq!(seen_by_server.identity, client.ctx.identity);
        assert_eq!(seen_by_server.node, Role::Consumer);
        assert_eq!(seen_by_server.pattern, "sensor:*");

        let seen_by_client = client_conn.peer().unwrap();
        assert_eq!(seen_by_client.bus, server.ctx.bus.id());
        assert_eq!(seen_by_client.node, Role::Peer);
    }

    #[tokio::test]
    async fn wrong_secret_fails_both_sides() {
        let server = peer();
        let client = peer();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);
        let (client_conn, ready) = spawn_client(&client, b, "foooooo");

        let result = timeout(TEST_TIMEOUT, ready).await.unwrap().unwrap();
        assert!(matches!(result, Err(MeshError::Authentication(_))));

        assert_eq!(timeout(TEST_TIMEOUT, client_conn.terminated()).await.unwrap(), ConnectionState::Failed);
        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Failed);
        assert!(server_conn.peer().is_none());
        assert!(!server_conn.is_connected());
    }

    #[tokio::test]
    async fn response_before_counter_fails() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);

        assert!(matches!(read_message(&mut raw).await, Some(Message::Challenge { .. })));
        messages::write_message(&mut raw, &Message::Response { answer: "x".into() })
            .await
            .unwrap();

        // The server half-closes; complete the close from this side.
        let mut rest = Vec::new();
        let _ = timeout(TEST_TIMEOUT, raw.read_to_end(&mut rest)).await;
        drop(raw);

        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn descriptor_before_verification_fails() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);

        assert!(matches!(read_message(&mut raw).await, Some(Message::Challenge { .. })));
        let descriptor = server.ctx.descriptor();
        messages::write_message(&mut raw, &Message::Authenticated(descriptor))
            .await
            .unwrap();
        drop(raw);

        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Failed);
        assert!(server_conn.peer().is_none());
    }

    #[tokio::test]
    async fn wrong_counter_answer_fails() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);

        assert!(matches!(read_message(&mut raw).await, Some(Message::Challenge { .. })));
        let counter = crypto::encrypt(crypto::CipherAlgorithm::default(), "n", SECRET).unwrap();
        messages::write_message(
            &mut raw,
            &Message::Counter {
                answer: "not-the-nonce".into(),
                counter,
            },
        )
        .await
        .unwrap();
        drop(raw);

        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn handshake_timeout_fails_silent_peer() {
        let server = side(MeshOptions {
            handshake_timeout: Some(100),
            ..Default::default()
        });
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);

        // Never answer, just drain until the server hangs up.
        tokio::spawn(async move {
            let mut sink = Vec::new();
            let _ = raw.read_to_end(&mut sink).await;
        });

        let state = timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap();
        assert_eq!(state, ConnectionState::Failed);
    }

    #[tokio::test]
    async fn retransmitted_event_delivered_once() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);
        let mut sub = server.ctx.bus.subscribe(EventFilter::new("test", None).unwrap());

        manual_client(&mut raw, "remote-bus").await;
        timeout(TEST_TIMEOUT, server_conn.authenticated()).await.unwrap().unwrap();

        let mut event = Event::new("test", json!("foo"));
        event.id = "evt-1".into();
        event.origin = "remote-bus".into();
        let message = Message::event(&event);
        messages::write_message(&mut raw, &message).await.unwrap();
        messages::write_message(&mut raw, &message).await.unwrap();

        // Echo of the server's own event must not be re-emitted.
        let mut own = event.clone();
        own.id = "evt-2".into();
        own.origin = server.ctx.bus.id().to_string();
        messages::write_message(&mut raw, &Message::event(&own)).await.unwrap();

        let mut marker = event.clone();
        marker.id = "evt-3".into();
        messages::write_message(&mut raw, &Message::event(&marker)).await.unwrap();

        assert_eq!(next_of_kind(&mut sub).await.id, "evt-1");
        assert_eq!(next_of_kind(&mut sub).await.id, "evt-3");
        assert_eq!(server.ctx.stats.received(), 2);
    }

    #[tokio::test]
    async fn malformed_event_after_auth_keeps_connection() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);
        let mut errors = server.ctx.bus.subscribe(EventFilter::new(EVENT_PEER_ERROR, None).unwrap());

        manual_client(&mut raw, "remote-bus").await;
        timeout(TEST_TIMEOUT, server_conn.authenticated()).await.unwrap().unwrap();

        messages::write_message(&mut raw, &Message::event(&Event::new("test", Value::Null)))
            .await
            .unwrap();

        let error = next_of_kind(&mut errors).await;
        assert!(error.data["error"].as_str().unwrap().contains("malformed"));
        assert!(server_conn.is_authenticated());
    }

    #[tokio::test]
    async fn oversized_frame_after_auth_ends_in_error() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);
        let mut errors = server.ctx.bus.subscribe(EventFilter::new(EVENT_PEER_ERROR, None).unwrap());
        let mut gone = server.ctx.bus.subscribe(EventFilter::new(EVENT_PEER_DISCONNECTED, None).unwrap());

        manual_client(&mut raw, "remote-bus").await;
        timeout(TEST_TIMEOUT, server_conn.authenticated()).await.unwrap().unwrap();

        raw.write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes()).await.unwrap();

        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Error);
        let error = next_of_kind(&mut errors).await;
        assert!(error.data["error"].as_str().unwrap().contains("exceeds maximum"));
        assert_eq!(error.data["state"], "error");
        assert_eq!(next_of_kind(&mut gone).await.data["state"], "error");

        let result = timeout(TEST_TIMEOUT, server_conn.close()).await.unwrap();
        assert!(matches!(result, Err(MeshError::Transport(_))), "got {result:?}");
    }

    #[tokio::test]
    async fn stream_ending_inside_frame_header_is_an_error() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let server_conn = spawn_server(&server, a);

        manual_client(&mut raw, "remote-bus").await;
        timeout(TEST_TIMEOUT, server_conn.authenticated()).await.unwrap().unwrap();

        raw.write_all(&[0, 0]).await.unwrap();
        drop(raw);

        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn close_completes_when_peer_stops_reading() {
        let server = peer();
        let (a, mut raw) = tokio::io::duplex(2048);
        let server_conn = spawn_server(&server, a);
        let mut errors = server.ctx.bus.subscribe(EventFilter::new(EVENT_PEER_ERROR, None).unwrap());

        manual_client(&mut raw, "remote-bus").await;
        timeout(TEST_TIMEOUT, server_conn.authenticated()).await.unwrap().unwrap();

        // `raw` stays open but is never read again, so the relay fills the link.
        for i in 0..200 {
            server.ctx.bus.emit(Event::new("flood", json!(i)));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = timeout(WRITE_TIMEOUT + TEST_TIMEOUT, server_conn.close())
            .await
            .expect("close hung on a peer that stopped reading");
        assert!(matches!(result, Err(MeshError::Transport(_))), "got {result:?}");
        assert_eq!(server_conn.state(), ConnectionState::Error);
        assert!(!server_conn.is_connected());

        let error = next_of_kind(&mut errors).await;
        assert!(error.data["error"].as_str().unwrap().contains("stalled"));
        drop(raw);
    }

    #[tokio::test]
    async fn peers_relay_both_ways() {
        let server = peer();
        let client = peer();
        let (_server_conn, _client_conn) = connect(&server, &client).await;

        let mut at_client = client.ctx.bus.subscribe(EventFilter::new("from:*", None).unwrap());
        let mut at_server = server.ctx.bus.subscribe(EventFilter::new("from:*", None).unwrap());

        let sent = server.ctx.bus.emit(Event::new("from:server", json!(1)));
        let got = next_of_kind(&mut at_client).await;
        assert_eq!(got.id, sent.id);
        assert_eq!(got.origin, server.ctx.bus.id());

        client.ctx.bus.emit(Event::new("from:client", json!(2)));
        // The server sees its own emit first, then the client's.
        assert_eq!(next_of_kind(&mut at_server).await.kind, "from:server");
        assert_eq!(next_of_kind(&mut at_server).await.kind, "from:client");

        assert_eq!(server.ctx.stats.transmitted(), 1);
        assert_eq!(server.ctx.stats.received(), 1);
    }

    #[tokio::test]
    async fn producer_is_opaque() {
        let server = peer();
        let producer = side(MeshOptions {
            producer: true,
            ..Default::default()
        });
        let (_server_conn, _producer_conn) = connect(&server, &producer).await;

        let mut at_producer = producer.ctx.bus.subscribe(EventFilter::new("from:*", None).unwrap());
        let mut at_server = server.ctx.bus.subscribe(EventFilter::new("from:producer", None).unwrap());

        server.ctx.bus.emit(Event::new("from:server", Value::Null));
        producer.ctx.bus.emit(Event::new("from:producer", Value::Null));

        // Producer events still flow out.
        assert_eq!(next_of_kind(&mut at_server).await.kind, "from:producer");

        // Only its own emit shows up on the producer's bus.
        assert_eq!(next_of_kind(&mut at_producer).await.kind, "from:producer");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(at_producer.try_recv().is_none());
        assert_eq!(server.ctx.stats.transmitted(), 0);
        assert_eq!(producer.ctx.stats.received(), 0);
    }

    #[tokio::test]
    async fn consumer_receives_matching_events_only() {
        let server = peer();
        let consumer = side(MeshOptions {
            consumer: true,
            pattern: Some("sensor:*".into()),
            condition: Some(json!({ "data.unit": "celsius" })),
            ..Default::default()
        });
        let (_server_conn, _consumer_conn) = connect(&server, &consumer).await;
        let mut at_consumer = consumer.ctx.bus.subscribe(EventFilter::new("/^(sensor|other):/", None).unwrap());

        server.ctx.bus.emit(Event::new("sensor:temp", json!({ "unit": "celsius" })));
        server.ctx.bus.emit(Event::new("other:temp", json!({ "unit": "celsius" })));
        server.ctx.bus.emit(Event::new("sensor:temp", json!({ "unit": "kelvin" })));
        server.ctx.bus.emit(Event::new("sensor:rh", json!({ "unit": "celsius" })));

        assert_eq!(next_of_kind(&mut at_consumer).await.kind, "sensor:temp");
        assert_eq!(next_of_kind(&mut at_consumer).await.kind, "sensor:rh");

        // A consumer never relays its own events.
        let mut at_server = server.ctx.bus.subscribe(EventFilter::new("local:*", None).unwrap());
        consumer.ctx.bus.emit(Event::new("local:reading", Value::Null));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(at_server.try_recv().is_none());
        assert_eq!(server.ctx.stats.transmitted(), 2);
    }

    #[tokio::test]
    async fn lifecycle_events_stay_local() {
        let server = peer();
        let client = peer();
        let mut at_client = client.ctx.bus.subscribe(EventFilter::new("mesh:*", None).unwrap());
        let (_server_conn, client_conn) = connect(&server, &client).await;

        server.ctx.publish(EVENT_PEER_ERROR, json!({ "probe": true }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        while let Some(event) = at_client.try_recv() {
            assert_eq!(event.source.as_deref(), Some(client.ctx.identity.as_str()));
        }
        client_conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_clean_and_idempotent() {
        let server = peer();
        let client = peer();
        let (server_conn, client_conn) = connect(&server, &client).await;

        timeout(TEST_TIMEOUT, client_conn.close()).await.unwrap().unwrap();
        assert_eq!(client_conn.state(), ConnectionState::Closed);
        assert!(!client_conn.is_connected());
        assert_eq!(timeout(TEST_TIMEOUT, server_conn.terminated()).await.unwrap(), ConnectionState::Closed);

        // Second close resolves immediately.
        timeout(Duration::from_millis(50), client_conn.close()).await.unwrap().unwrap();
        timeout(Duration::from_millis(50), server_conn.close()).await.unwrap().unwrap();
    }

    #[test]
    fn terminal_states() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(ConnectionState::Error.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(!ConnectionState::Challenge.is_terminal());
        assert!(!ConnectionState::Authenticated.is_terminal());
        assert_eq!(ConnectionState::Authenticating.to_string(), "authenticating");
    }
}
