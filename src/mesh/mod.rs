//! Direct peer-to-peer channels between the members of a room.

pub mod channel;
pub mod manager;

pub use channel::{AsyncStream, ChannelError, ChannelState, FrameReader, FrameWriter, PeerChannel, PeerStream};
pub use manager::{Frame, MeshEvent, PeerMesh};
