//! Peer channels: a reliable ordered byte stream plus length-prefixed framing.
//!
//! Each frame on the wire is a 4-byte big-endian length followed by that many
//! payload bytes. Frames longer than the configured maximum fail the channel.

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::peer::PeerId;

/// Transport a connector hands to the mesh once negotiation completes.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type PeerStream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("outbound queue to {0} is full")]
    Backpressure(PeerId),
    #[error("channel to {0} is not open")]
    NotOpen(PeerId),
    #[error("channel to {peer} failed: {reason}")]
    Failed { peer: PeerId, reason: String },
    #[error("invalid channel transition {from:?} -> {to:?}")]
    InvalidTransition { from: ChannelState, to: ChannelState },
}

/// Lifecycle of one peer channel.
///
/// ```text
/// Connecting ──► Open ──► Closing ──► Closed
///     │           │          │
///     └───────────┴──────────┴──────► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed)
    }

    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(&mut self, next: ChannelState) -> Result<(), ChannelError> {
        if !self.can_transition_to(next) {
            return Err(ChannelError::InvalidTransition { from: *self, to: next });
        }
        *self = next;
        Ok(())
    }
}

/// An established transport to one remote peer.
pub struct PeerChannel {
    peer: PeerId,
    stream: PeerStream,
}

impl PeerChannel {
    pub fn new(peer: PeerId, stream: PeerStream) -> Self {
        Self { peer, stream }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Splits into independently owned framed halves.
    pub fn into_split(self, max_frame_len: usize) -> (FrameReader, FrameWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            FrameReader {
                inner: read,
                max_frame_len,
            },
            FrameWriter {
                inner: write,
                max_frame_len,
            },
        )
    }
}

impl fmt::Debug for PeerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerChannel").field("peer", &self.peer).finish_non_exhaustive()
    }
}

pub struct FrameReader {
    inner: ReadHalf<PeerStream>,
    max_frame_len: usize,
}

impl FrameReader {
    /// Reads the next frame; `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if len > self.max_frame_len {
            return Err(ChannelError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let mut payload = vec![0; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Some(payload))
    }
}

pub struct FrameWriter {
    inner: WriteHalf<PeerStream>,
    max_frame_len: usize,
}

impl FrameWriter {
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if payload.len() > self.max_frame_len {
            return Err(ChannelError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        self.inner.write_u32(payload.len() as u32).await?;
        self.inner.write_all(payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
