//! # Wire Protocol Messages
//!
//! Every application message is one JSON object, discriminated by its
//! `object` field, carried in a length-prefixed frame:
//!
//! ```text
//! +----------------+---------------------------+
//! | len: u32 (BE)  | JSON payload (len bytes)  |
//! +----------------+---------------------------+
//! ```
//!
//! A TLS stream may coalesce or fragment writes, so frames are always read
//! with `read_exact` against the declared length.
//!
//! ## Object Kinds
//!
//! | object | sender | fields |
//! |--------|--------|--------|
//! | `challenge` | server | `challenge` (sealed nonce) |
//! | `counter` | client | `answer` (plaintext), `counter` (sealed nonce) |
//! | `response` | server | `answer` (plaintext) |
//! | `authenticated` | both | peer descriptor |
//! | `event` | both, after authentication | event fields, at least `id` and `origin` |

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bus::Event;
use crate::config::Role;
use crate::error::{MeshError, MeshResult};

/// Maximum frame payload (1 MiB).
/// SECURITY: bounds the allocation an unauthenticated peer can trigger.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Handshake protocol revision carried in every descriptor.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identity and subscription metadata exchanged in the final handshake step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Mesh node identity.
    pub identity: String,
    /// Local bus id of the node.
    pub bus: String,
    /// Role the node runs as.
    pub node: Role,
    pub pattern: String,
    #[serde(default)]
    pub condition: Value,
    /// Crate version of the sender.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "lowercase")]
pub enum Message {
    Challenge { challenge: String },
    Counter { answer: String, counter: String },
    Response { answer: String },
    Authenticated(PeerDescriptor),
    Event(Event),
}

impl Message {
    /// Wrap a bus event for relay. Drops any stray `object` key so the
    /// discriminator is never duplicated on the wire.
    pub fn event(event: &Event) -> Self {
        let mut event = event.clone();
        event.extra.remove("object");
        Message::Event(event)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Challenge { .. } => "challenge",
            Message::Counter { .. } => "counter",
            Message::Response { .. } => "response",
            Message::Authenticated(_) => "authenticated",
            Message::Event(_) => "event",
        }
    }
}

pub fn encode(message: &Message) -> MeshResult<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(MeshError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode(payload: &[u8]) -> MeshResult<Message> {
    Ok(serde_json::from_slice(payload)?)
}

/// Write one framed message and flush it.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame payload. Returns `Ok(None)` only when the stream ends
/// cleanly before the first byte of a frame.
///
/// A stream that ends inside the length prefix or the payload is an error, as
/// is any error the transport itself reports (for TLS, a missing
/// `close_notify`).
pub async fn read_frame<R>(reader: &mut R) -> MeshResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} of 4 frame header bytes"),
                )
                .into());
            }
            n => filled += n,
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MeshError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
