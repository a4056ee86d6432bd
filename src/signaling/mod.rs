//! Room rendezvous and connection negotiation.

pub mod backoff;
pub mod client;
pub mod connector;
pub mod protocol;

use thiserror::Error;

pub use backoff::Backoff;
pub use client::{RoomMembership, SignalingClient, SignalingEvent};
pub use connector::{ConnectError, Connector, PendingAnswer, PendingOffer, TcpConnector};
pub use protocol::SignalMessage;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },
    #[error("room name must not be empty")]
    EmptyRoom,
    #[error("rendezvous refused join: {0}")]
    Rejected(String),
    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tokio_tungstenite::tungstenite::Error>),
    #[error("invalid signaling message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}
