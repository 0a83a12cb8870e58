//! # eventmesh - Peer-to-Peer Event Gossip over TLS
//!
//! eventmesh joins the local event buses of separate processes into one
//! logical bus. Every node dials or accepts TLS links to other nodes, proves
//! knowledge of a shared secret with a mutual challenge-response handshake,
//! and then relays bus events across the link.
//!
//! - **Relay**: an event emitted on one bus reaches every reachable bus,
//!   delivered at most once per link by a bounded duplicate detector
//! - **Roles**: `peer` relays both ways, `producer` only sends, `consumer`
//!   only receives events matching its declared pattern and condition
//! - **Lifecycle**: configuration, dialing, listening and heartbeats are
//!   reported as `mesh:*` events on the local bus
//!
//! ## Architecture
//!
//! Actor pattern throughout:
//! - [`MeshNode`] is a cheap-to-clone handle over the controller actor
//!   (registry, listener, heartbeat)
//! - each connection is its own actor plus a frame-reader task
//! - connections report closure to the controller over a channel and never
//!   touch the registry directly
//!
//! ## Security Model
//!
//! - TLS on every link; certificates are loaded from PEM files or generated
//!   self-signed at configure time
//! - peers are authenticated by the handshake, not the certificate chain:
//!   each side proves it can open a nonce sealed under the shared secret
//! - the secret never crosses the wire
//! - frames are capped at 1 MiB before any allocation
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Mesh controller: configure, connect, start, stop, heartbeat |
//! | `connection` | Per-link handshake and relay state machine |
//! | `config` | Option surface, defaults and validation |
//! | `bus` | Event model, filters, bus trait and in-process bus |
//! | `crypto` | Challenge cipher and TLS material |
//! | `messages` | Wire messages and length-prefixed framing |
//! | `seen` | Bounded duplicate detector |
//! | `error` | `MeshError` taxonomy |

mod bus;
mod config;
mod connection;
mod crypto;
mod error;
mod messages;
mod node;
mod seen;

pub use bus::{DEFAULT_BUS_CAPACITY, Event, EventBus, EventFilter, LocalBus, MATCH_ALL, Subscription};
pub use config::{
    ConnectOptions, DEFAULT_CHALLENGE_SIZE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_HOST, DEFAULT_PORT,
    MeshConfiguration, MeshOptions, Role,
};
pub use connection::{
    CLOSE_LINGER, ConnectionHandle, ConnectionState, Direction, EVENT_PEER_AUTHENTICATED, EVENT_PEER_CONNECTED,
    EVENT_PEER_DISCONNECTED, EVENT_PEER_ERROR, StatsSnapshot, WRITE_TIMEOUT,
};
pub use crypto::{CipherAlgorithm, TlsMaterial, self_signed_pem};
pub use error::{MeshError, MeshResult};
pub use messages::{MAX_FRAME_SIZE, PROTOCOL_VERSION, PeerDescriptor};
pub use node::{
    EVENT_PEER_CONNECTING, EVENT_PEER_HEARTBEAT, EVENT_SERVER_ERROR, EVENT_SERVER_STARTED, EVENT_SERVER_STARTING,
    MeshNode,
};
pub use seen::{DEFAULT_SEEN_CAPACITY, Seen};
