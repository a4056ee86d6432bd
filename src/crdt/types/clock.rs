//! Lamport clock implementation for generating operation identifiers.
//!
//! This module contains the LamportClock struct which hands out operation ids
//! for the local replica and keeps them ahead of every id observed remotely.

use crate::crdt::types::op_id::OpId;
use crate::crdt::types::replica::ReplicaId;

/// A clock for generating Lamport-ordered operation ids.
///
/// Besides the Lamport counter the clock remembers the counter of the last
/// id it issued, so each local operation can name its predecessor from the
/// same replica.
#[derive(Debug, Clone)]
pub struct LamportClock {
    counter: u64,
    last_issued: u64,
    replica_id: ReplicaId,
}

impl LamportClock {
    /// Creates a new Lamport clock
    pub fn new(replica_id: ReplicaId) -> Self {
        LamportClock {
            counter: 0,
            last_issued: 0,
            replica_id,
        }
    }

    /// Generates the next id for this replica.
    ///
    /// Returns the new id together with the counter of the previously issued
    /// id (0 for the first one).
    pub fn tick(&mut self) -> (OpId, u64) {
        self.counter += 1;
        let prev = self.last_issued;
        self.last_issued = self.counter;
        (OpId::new(self.counter, self.replica_id), prev)
    }

    /// Updates the clock based on a received id (for causal consistency)
    pub fn observe(&mut self, received: OpId) {
        self.counter = self.counter.max(received.counter);
    }

    /// Gets the current counter value
    pub fn current_counter(&self) -> u64 {
        self.counter
    }

    /// Gets the replica ID
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }
}
