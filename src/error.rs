use thiserror::Error;

use crate::codec::{DecodeError, EncodeError};
use crate::config::ConfigError;
use crate::crdt::ReplicaError;
use crate::mesh::ChannelError;
use crate::signaling::SignalingError;

/// Errors surfaced by the sync engine's public API.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Replica(#[from] ReplicaError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("room name must not be empty")]
    EmptyRoom,
    #[error("sync engine has shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, SyncError>;
