//! The transport seam: how an offer/answer exchange becomes a byte stream.
//!
//! The signaling client only relays opaque session descriptions; a
//! [`Connector`] decides what they mean. [`TcpConnector`] is the built-in
//! implementation: the initiator listens on an ephemeral port and offers its
//! address, the responder dials it and proves it read the offer by echoing a
//! one-time token.

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;
use uuid::Uuid;

use crate::config::TcpConfig;
use crate::mesh::PeerStream;
use crate::peer::PeerId;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("handshake with remote failed")]
    Handshake,
    #[error("negotiation timed out")]
    Timeout,
    #[error("negotiation cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Starts a connection this side initiates.
    async fn offer(&self, remote: PeerId) -> Result<Box<dyn PendingOffer>, ConnectError>;

    /// Accepts an offer received from `remote`.
    async fn answer(&self, remote: PeerId, offer_sdp: &str) -> Result<Box<dyn PendingAnswer>, ConnectError>;

    /// A connectivity candidate trickled in by `remote`.
    async fn remote_candidate(&self, remote: PeerId, candidate: &str) {
        debug!(%remote, candidate, "ignoring remote candidate");
    }
}

#[async_trait]
pub trait PendingOffer: Send {
    fn sdp(&self) -> String;

    /// Candidates to trickle to the remote after the offer.
    fn candidates(&self) -> Vec<String> {
        Vec::new()
    }

    async fn complete(self: Box<Self>, answer_sdp: &str) -> Result<PeerStream, ConnectError>;
}

#[async_trait]
pub trait PendingAnswer: Send {
    fn sdp(&self) -> String;

    async fn connected(self: Box<Self>) -> Result<PeerStream, ConnectError>;
}

const TCP_SCHEME: &str = "tcp";
const TCP_ANSWER: &str = "tcp ok";

/// Direct TCP connections, one listener per offer.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: TcpConfig,
}

impl TcpConnector {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

fn parse_offer(sdp: &str) -> Result<(SocketAddr, Uuid), ConnectError> {
    let invalid = || ConnectError::InvalidDescription(sdp.to_string());
    let mut parts = sdp.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(TCP_SCHEME), Some(addr), Some(token), None) => {
            let addr = addr.parse().map_err(|_| invalid())?;
            let token = token.parse().map_err(|_| invalid())?;
            Ok((addr, token))
        }
        _ => Err(invalid()),
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn offer(&self, remote: PeerId) -> Result<Box<dyn PendingOffer>, ConnectError> {
        let listener = TcpListener::bind(self.config.bind).await?;
        let bound = listener.local_addr()?;
        let advertised = match self.config.advertise {
            Some(addr) if addr.port() == 0 => SocketAddr::new(addr.ip(), bound.port()),
            Some(addr) => addr,
            None => bound,
        };
        let token = Uuid::new_v4();
        debug!(%remote, %advertised, "listening for peer");
        Ok(Box::new(TcpOffer {
            listener,
            sdp: format!("{TCP_SCHEME} {advertised} {token}"),
            token,
        }))
    }

    async fn answer(&self, remote: PeerId, offer_sdp: &str) -> Result<Box<dyn PendingAnswer>, ConnectError> {
        let (addr, token) = parse_offer(offer_sdp)?;
        debug!(%remote, %addr, "dialing peer");
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(token.as_bytes()).await?;
        Ok(Box::new(TcpAnswer { stream }))
    }
}

struct TcpOffer {
    listener: TcpListener,
    sdp: String,
    token: Uuid,
}

#[async_trait]
impl PendingOffer for TcpOffer {
    fn sdp(&self) -> String {
        self.sdp.clone()
    }

    async fn complete(self: Box<Self>, answer_sdp: &str) -> Result<PeerStream, ConnectError> {
        if answer_sdp != TCP_ANSWER {
            return Err(ConnectError::InvalidDescription(answer_sdp.to_string()));
        }
        let (mut stream, from) = self.listener.accept().await?;
        let mut token = [0u8; 16];
        stream.read_exact(&mut token).await?;
        if token != *self.token.as_bytes() {
            debug!(%from, "rejecting connection with wrong token");
            return Err(ConnectError::Handshake);
        }
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

struct TcpAnswer {
    stream: TcpStream,
}

#[async_trait]
impl PendingAnswer for TcpAnswer {
    fn sdp(&self) -> String {
        TCP_ANSWER.to_string()
    }

    async fn connected(self: Box<Self>) -> Result<PeerStream, ConnectError> {
        Ok(Box::new(self.stream))
    }
}
