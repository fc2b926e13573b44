//! Wire protocol for PeerVault peers.
//!
//! Every frame on a connection is one tag byte. A `MESSAGE_FRAME` is
//! followed by a u32-LE length and a bincode-encoded [`ControlMessage`]
//! (explicit discriminant, field-ordered, length-prefixed strings). A
//! `STREAM_FRAME` hands the rest of the connection to whichever task is
//! consuming the stream announced by the preceding message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame tag: a bounded control message follows.
pub const MESSAGE_FRAME: u8 = 0x01;

/// Frame tag: the connection switches to a raw byte stream.
pub const STREAM_FRAME: u8 = 0x02;

/// Upper bound on one encoded control message.
pub const MAX_MESSAGE_BYTES: usize = 1028;

/// Protocol errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_BYTES}-byte frame bound")]
    MessageTooLarge(usize),
    #[error("unknown frame tag {0:#04x}")]
    UnknownFrame(u8),
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

/// Where a known peer address was first learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerSource {
    Seed,
    Mdns,
    Pex,
}

impl fmt::Display for PeerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerSource::Seed => "seed",
            PeerSource::Mdns => "mdns",
            PeerSource::Pex => "pex",
        };
        f.write_str(name)
    }
}

/// One gossiped peer address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub last_seen_unix: u64,
    pub source: PeerSource,
}

/// Control messages exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// The sender is about to stream a blob it just stored; exactly
    /// `size` ciphertext bytes (IV included) follow a `STREAM_FRAME`.
    StoreNotice {
        owner: String,
        key_id: String,
        size: u64,
    },
    /// The sender wants a blob; any holder replies with a
    /// `STREAM_FRAME`, a u64-LE ciphertext size, and the bytes.
    GetRequest { requester: String, key_id: String },
    /// The owner removed a blob; holders drop their replica.
    DeleteNotice { owner: String, key_id: String },
    /// Periodic peer-exchange payload.
    PeerGossip { peers: Vec<PeerRecord> },
}

/// Encode a message body, enforcing the frame bound.
pub fn encode_message(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(msg).map_err(ProtocolError::Encode)?;
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge(body.len()));
    }
    Ok(body)
}

/// Encode a full message frame: tag, u32-LE length, body.
pub fn encode_frame(msg: &ControlMessage) -> Result<Vec<u8>, ProtocolError> {
    let body = encode_message(msg)?;
    let mut frame = Vec::with_capacity(1 + 4 + body.len());
    frame.push(MESSAGE_FRAME);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a message body received off the wire.
pub fn decode_message(body: &[u8]) -> Result<ControlMessage, ProtocolError> {
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::MessageTooLarge(body.len()));
    }
    bincode::deserialize(body).map_err(ProtocolError::Decode)
}

/// A non-stream frame delivered through the transport's inbound queue.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Remote address of the connection the frame arrived on.
    pub from: String,
    /// Encoded message body; empty for stream handovers.
    pub payload: Vec<u8>,
    /// True when the connection switched to a raw stream.
    pub is_stream: bool,
}
