//! Error taxonomy for mesh operations.
//!
//! Every failure is local to one connection or to one listening attempt.
//! Callers see these through the `Result` of the [`MeshNode`](crate::MeshNode)
//! operation they invoked; the same failures are also published on the local
//! bus as `mesh:peer:error` / `mesh:server:error` events.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::Role;

#[derive(Debug, Error)]
pub enum MeshError {
    /// `connect` or `start` was called before `configure`.
    #[error("mesh networking not configured")]
    NotConfigured,

    /// Only full peers accept inbound connections.
    #[error("node role {0} cannot accept inbound connections")]
    ListenerRole(Role),

    #[error("listener already bound on {0}")]
    AlreadyListening(SocketAddr),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    /// Secret mismatch or a handshake step that failed verification.
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("connection closed before authentication completed")]
    ClosedBeforeAuthentication,

    /// A message arrived out of order for the current handshake step.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("cipher error: {0}")]
    Cipher(String),

    /// Socket-level failure after the connection was established.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("mesh node has shut down")]
    Shutdown,
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Malformed(err.to_string())
    }
}

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;
