//! Binary wire format for updates, state vectors and peer messages.
//!
//! Everything is encoded with postcard: integers are variable-width,
//! sequences and strings carry a length prefix. Peer messages additionally
//! start with one protocol version byte:
//!
//! ```text
//! ┌─────────┬─────────────┬────────────────────────────┐
//! │ version │ variant tag │ variant body               │
//! │ 1 byte  │ varint      │ postcard, length-prefixed  │
//! └─────────┴─────────────┴────────────────────────────┘
//! ```
//!
//! Decoding never hands back partial values: input must be consumed exactly.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::awareness::AwarenessUpdate;
use crate::crdt::{StateVector, Update};

/// Version byte in front of every peer message.
pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed payload: {0}")]
    Malformed(#[from] postcard::Error),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

#[derive(Debug, Error)]
#[error("failed to encode payload: {0}")]
pub struct EncodeError(#[from] postcard::Error);

/// Messages exchanged over a peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// The sender's state vector; the receiver answers with `SyncStep2`.
    SyncStep1(StateVector),
    /// Everything the receiver of a `SyncStep1` was missing.
    SyncStep2(Update),
    /// Incremental update, local or relayed.
    Update(Update),
    Awareness(Vec<AwarenessUpdate>),
    /// Ask the receiver for its whole awareness table.
    AwarenessQuery,
}

impl PeerMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::SyncStep1(_) => "sync_step1",
            PeerMessage::SyncStep2(_) => "sync_step2",
            PeerMessage::Update(_) => "update",
            PeerMessage::Awareness(_) => "awareness",
            PeerMessage::AwarenessQuery => "awareness_query",
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(postcard::to_allocvec(value)?)
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, DecodeError> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(DecodeError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

pub fn encode_update(update: &Update) -> Result<Vec<u8>, EncodeError> {
    encode(update)
}

pub fn decode_update(bytes: &[u8]) -> Result<Update, DecodeError> {
    decode(bytes)
}

pub fn encode_state_vector(sv: &StateVector) -> Result<Vec<u8>, EncodeError> {
    encode(sv)
}

pub fn decode_state_vector(bytes: &[u8]) -> Result<StateVector, DecodeError> {
    decode(bytes)
}

pub fn encode_message(message: &PeerMessage) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = vec![PROTOCOL_VERSION];
    bytes.extend(encode(message)?);
    Ok(bytes)
}

pub fn decode_message(bytes: &[u8]) -> Result<PeerMessage, DecodeError> {
    let (&version, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
    if version != PROTOCOL_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    decode(body)
}
