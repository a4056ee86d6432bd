//! CRDT (Conflict-free Replicated Data Type) implementation module.
//!
//! This module contains the replica store, an RGA (Replicated Growable Array)
//! over characters with per-character style attributes, and all its
//! supporting types.

pub mod node;
pub mod operation;
pub mod replica;
pub mod snapshot;
pub mod types;

// Re-export the main public API
pub use node::{AttributeValue, Node, SENTINEL_ROOT_CHAR};
pub use operation::{LocalEdit, OpKind, Operation, Update};
pub use replica::{DEFAULT_PENDING_LIMIT, Replica, ReplicaError};
pub use snapshot::{Snapshot, Span};
pub use types::{LamportClock, OpId, ReplicaId, StateVector, random_replica_id};
