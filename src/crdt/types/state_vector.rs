//! State vectors: per-replica high-water marks.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crdt::types::op_id::OpId;
use crate::crdt::types::replica::ReplicaId;

/// Highest integrated operation counter per replica.
///
/// Entries only ever grow. Backed by a sorted map so two equal vectors
/// always encode to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: BTreeMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest counter seen from `replica`, 0 when nothing was seen.
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.clocks.get(&replica).copied().unwrap_or(0)
    }

    /// Raises the entry for `id.replica` to `id.counter` if that is higher.
    pub fn observe(&mut self, id: OpId) {
        let entry = self.clocks.entry(id.replica).or_insert(0);
        *entry = (*entry).max(id.counter);
    }

    /// Whether the vector covers `id`.
    pub fn contains(&self, id: OpId) -> bool {
        id.is_root() || self.get(id.replica) >= id.counter
    }

    /// Whether every entry of `other` is covered by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .clocks
            .iter()
            .all(|(&replica, &counter)| self.get(replica) >= counter)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReplicaId, u64)> + '_ {
        self.clocks.iter().map(|(&r, &c)| (r, c))
    }

    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<I: IntoIterator<Item = (ReplicaId, u64)>>(iter: I) -> Self {
        let mut sv = StateVector::new();
        for (replica, counter) in iter {
            sv.observe(OpId::new(counter, replica));
        }
        sv
    }
}
