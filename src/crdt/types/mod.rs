//! Type definitions for the replica CRDT.
//!
//! This module contains the fundamental identifier types used throughout the
//! replica store, organized into focused submodules.

pub mod clock;
pub mod op_id;
pub mod replica;
pub mod state_vector;

pub use clock::LamportClock;
pub use op_id::OpId;
pub use replica::{ROOT_REPLICA, ReplicaId, random_replica_id};
pub use state_vector::StateVector;
