//! Operation identifier implementation.
//!
//! This module contains the OpId struct which serves as the globally unique
//! identifier of every operation in the replica log, providing both identity
//! and a total order.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crdt::types::replica::{ROOT_REPLICA, ReplicaId};

/// A unique identifier for each operation: a Lamport counter and the
/// authoring replica's id.
///
/// # Ordering
///
/// Identifiers are ordered first by counter, then by replica id. Because a
/// replica's counter is always advanced past every counter it has observed,
/// an operation sorts after every operation it was causally created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// The logical clock value when this operation was created
    pub counter: u64,
    /// The ID of the replica that created this operation
    pub replica: ReplicaId,
}

impl OpId {
    /// The document root. Inserting after the root inserts at the start.
    pub const ROOT: OpId = OpId {
        counter: 0,
        replica: ROOT_REPLICA,
    };

    /// Creates a new OpId from a counter and replica id
    pub fn new(counter: u64, replica: ReplicaId) -> Self {
        OpId { counter, replica }
    }

    /// Returns true for the reserved root identifier.
    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.replica.cmp(&other.replica))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:x}", self.counter, self.replica)
    }
}
