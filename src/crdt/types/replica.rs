//! Replica identifier type and related functionality.
//!
//! This module contains the definition of ReplicaId, which uniquely identifies
//! each participant's copy of the document.

/// A unique identifier for each replica (collaborator) in the distributed system.
///
/// Each participant in the collaborative editing system should have a unique replica ID.
/// This ensures that operations from different replicas can be distinguished and ordered.
/// The value `0` is reserved for the document root.
pub type ReplicaId = u64;

/// Replica id owned by the document root. Never assigned to a participant.
pub const ROOT_REPLICA: ReplicaId = 0;

/// Generates a random replica id for this process.
///
/// Ids are drawn from the full `u64` range, skipping the reserved root id.
pub fn random_replica_id() -> ReplicaId {
    loop {
        let id: ReplicaId = rand::random();
        if id != ROOT_REPLICA {
            return id;
        }
    }
}
