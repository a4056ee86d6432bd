//! # peer-sync - serverless collaborative document sync
//!
//! Replicas of one attributed-text document edit concurrently and converge
//! without a central server. The crate is layered, leaves first:
//!
//! - [`crdt`]: the replica store, an RGA sequence CRDT with tombstones,
//!   per-character attributes and an operation log ordered by Lamport id
//! - [`codec`]: compact binary encoding of updates, state vectors and peer
//!   messages
//! - [`awareness`]: ephemeral, versioned presence with liveness expiry
//! - [`signaling`]: room rendezvous and offer/answer negotiation
//! - [`mesh`]: framed peer channels and flood-fill broadcast
//! - [`sync`]: the orchestrator tying it all to one event loop
//! - [`server`]: the rendezvous server shipped as `peer-sync-rendezvous`
//!
//! ## Example
//!
//! ```rust
//! use peer_sync::{LocalEdit, Replica};
//!
//! let mut alice = Replica::new(1);
//! let mut bob = Replica::new(2);
//!
//! let update = alice.apply_local(LocalEdit::insert(0, "hello"));
//! bob.apply_remote(&update).unwrap();
//! bob.apply_local(LocalEdit::insert(5, " world"));
//!
//! let missing = bob.diff_since(alice.state_vector());
//! alice.apply_remote(&missing).unwrap();
//! assert_eq!(alice.to_string(), "hello world");
//! assert_eq!(alice.to_string(), bob.to_string());
//! ```

pub mod awareness;
pub mod codec;
pub mod config;
pub mod crdt;
pub mod error;
pub mod mesh;
pub mod peer;
pub mod server;
pub mod signaling;
pub mod sync;

// Re-export the main public API
pub use awareness::{AwarenessChange, AwarenessState, AwarenessTable, AwarenessUpdate, UserPresence};
pub use codec::{DecodeError, EncodeError, PeerMessage};
pub use config::{RendezvousConfig, SyncConfig};
pub use crdt::{LocalEdit, OpId, Operation, Replica, ReplicaError, ReplicaId, Snapshot, Span, StateVector, Update};
pub use error::{Result, SyncError};
pub use peer::PeerId;
pub use signaling::{Connector, SignalingError, TcpConnector};
pub use sync::{SyncEvent, SyncHandle, SyncOrchestrator};
