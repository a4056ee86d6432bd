//! Core replica store.
//!
//! This module contains the [`Replica`] struct: the document sequence, the
//! operation log and the buffer of operations waiting for their causal
//! dependencies.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crossbeam_skiplist::SkipMap;
use thiserror::Error;
use tracing::warn;

use crate::crdt::node::Node;
use crate::crdt::operation::{LocalEdit, OpKind, Operation, Update};
use crate::crdt::snapshot::Snapshot;
use crate::crdt::types::{LamportClock, OpId, ROOT_REPLICA, ReplicaId, StateVector};

/// Default number of remote operations buffered while waiting for their
/// dependencies.
pub const DEFAULT_PENDING_LIMIT: usize = 65_536;

/// Errors raised while merging remote operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaError {
    #[error("malformed operation {id}: {reason}")]
    MalformedOperation { id: OpId, reason: &'static str },
}

/// One participant's copy of the document.
///
/// Insert placement follows the RGA rule: a new character goes after its
/// anchor, past every node whose id is greater than its own. Ids are Lamport
/// ordered, so those nodes are exactly the concurrent siblings that win the
/// tie-break together with their descendants.
///
/// # Design
///
/// - `nodes` holds every node by id, tombstones and the root sentinel
///   included, each linked to its successor in document order
/// - `log` holds every integrated operation ordered by id, which is also a
///   causal order, so `diff_since` can stream it as-is
/// - `pending` holds remote operations whose dependencies are not integrated,
///   at most `pending_limit` of them
pub struct Replica {
    /// The unique identifier for this replica
    replica_id: ReplicaId,
    clock: LamportClock,
    nodes: HashMap<OpId, Node>,
    /// Number of visible characters
    visible: usize,
    log: SkipMap<OpId, Operation>,
    state_vector: StateVector,
    pending: BTreeMap<OpId, Operation>,
    pending_limit: usize,
}

impl Replica {
    /// Creates an empty document owned by `replica_id`.
    pub fn new(replica_id: ReplicaId) -> Self {
        Replica {
            replica_id,
            clock: LamportClock::new(replica_id),
            nodes: HashMap::from([(OpId::ROOT, Node::root())]),
            visible: 0,
            log: SkipMap::new(),
            state_vector: StateVector::new(),
            pending: BTreeMap::new(),
            pending_limit: DEFAULT_PENDING_LIMIT,
        }
    }

    /// Caps the buffer of operations waiting for dependencies. When it
    /// overflows, the operations with the highest ids are dropped; they never
    /// reached the state vector, so the next `diff_since` exchange with their
    /// sender brings them back.
    pub fn with_pending_limit(mut self, limit: usize) -> Self {
        self.pending_limit = limit;
        self
    }

    /// Gets the replica ID for this instance.
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Gets the current Lamport counter.
    pub fn current_clock(&self) -> u64 {
        self.clock.current_counter()
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    /// Applies an edit authored locally and returns the update to broadcast.
    ///
    /// Positions are clamped to the document bounds, so this never fails.
    /// The update is empty when the edit touches no character.
    pub fn apply_local(&mut self, edit: LocalEdit) -> Update {
        let context = self.state_vector.clone();
        let mut operations = Vec::new();

        match edit {
            LocalEdit::Insert { index, text } => {
                let mut after = self.anchor_before(index);
                for content in text.chars() {
                    let op = self.next_operation(OpKind::Insert { after, content });
                    after = op.id;
                    self.integrate(&op);
                    operations.push(op);
                }
            }
            LocalEdit::Delete { index, len } => {
                for target in self.visible_ids(index, len) {
                    let op = self.next_operation(OpKind::Delete { target });
                    self.integrate(&op);
                    operations.push(op);
                }
            }
            LocalEdit::Format {
                index,
                len,
                key,
                value,
            } => {
                for target in self.visible_ids(index, len) {
                    let op = self.next_operation(OpKind::Format {
                        target,
                        key: key.clone(),
                        value: value.clone(),
                    });
                    self.integrate(&op);
                    operations.push(op);
                }
            }
        }

        Update::new(context, operations)
    }

    /// Merges a foreign update.
    ///
    /// The whole update is validated before anything is touched; one
    /// malformed operation rejects it. Known operations are skipped, the rest
    /// are integrated once their dependencies are, buffering them until then.
    ///
    /// Returns the operations that became integrated during this call,
    /// including previously buffered ones that were released. An empty
    /// result means the update brought nothing new.
    pub fn apply_remote(&mut self, update: &Update) -> Result<Update, ReplicaError> {
        let incoming: HashMap<OpId, bool> = update
            .operations
            .iter()
            .map(|op| (op.id, op.is_insert()))
            .collect();
        for op in &update.operations {
            self.validate(op, &incoming)?;
        }

        let context = self.state_vector.clone();
        let mut integrated = Vec::new();

        for op in &update.operations {
            if self.log.contains_key(&op.id) || self.pending.contains_key(&op.id) {
                continue;
            }
            if self.is_ready(op) {
                self.integrate(op);
                integrated.push(op.clone());
            } else {
                self.pending.insert(op.id, op.clone());
            }
        }

        if !integrated.is_empty() {
            integrated.extend(self.release_pending());
        }
        self.trim_pending();

        Ok(Update::new(context, integrated))
    }

    /// Every integrated operation the owner of `remote` has not seen.
    pub fn diff_since(&self, remote: &StateVector) -> Update {
        if remote.dominates(&self.state_vector) {
            return Update::new(remote.clone(), Vec::new());
        }
        let operations = self
            .log
            .iter()
            .filter(|entry| !remote.contains(*entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        Update::new(remote.clone(), operations)
    }

    /// The visible content, attributes included.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for node in self.visible_nodes() {
            snapshot.push(node.character, node.visible_attributes());
        }
        snapshot
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }

    /// Number of nodes including tombstones, excluding the root.
    pub fn total_node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Number of integrated operations.
    pub fn operation_count(&self) -> usize {
        self.log.len()
    }

    /// Number of operations waiting for missing dependencies.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Ids of the visible characters, in document order.
    pub fn visible_ids(&self, index: usize, len: usize) -> Vec<OpId> {
        self.visible_nodes().skip(index).take(len).map(|n| n.id).collect()
    }

    /// Copies this document into a new replica with another id.
    pub fn fork(&self, replica_id: ReplicaId) -> Replica {
        let log = SkipMap::new();
        for entry in self.log.iter() {
            log.insert(*entry.key(), entry.value().clone());
        }

        let mut clock = LamportClock::new(replica_id);
        clock.observe(OpId::new(self.clock.current_counter(), self.replica_id));

        Replica {
            replica_id,
            clock,
            nodes: self.nodes.clone(),
            visible: self.visible,
            log,
            state_vector: self.state_vector.clone(),
            pending: self.pending.clone(),
            pending_limit: self.pending_limit,
        }
    }

    /// Nodes after the root sentinel in document order, tombstones included.
    fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        let mut next = self.nodes.get(&OpId::ROOT).and_then(|root| root.next);
        std::iter::from_fn(move || {
            let node = self.nodes.get(&next?)?;
            next = node.next;
            Some(node)
        })
    }

    fn visible_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.iter().filter(|n| n.is_visible())
    }

    fn next_operation(&mut self, kind: OpKind) -> Operation {
        let (id, prev) = self.clock.tick();
        Operation { id, prev, kind }
    }

    /// Id of the visible character just before `index`, or the root.
    fn anchor_before(&self, index: usize) -> OpId {
        if index == 0 {
            return OpId::ROOT;
        }
        self.visible_nodes()
            .take(index)
            .last()
            .map_or(OpId::ROOT, |n| n.id)
    }

    fn is_insert_known(&self, id: OpId) -> bool {
        id.is_root()
            || self
                .log
                .get(&id)
                .is_some_and(|entry| entry.value().is_insert())
    }

    /// Whether every dependency of `op` is integrated.
    fn is_ready(&self, op: &Operation) -> bool {
        self.state_vector.get(op.id.replica) >= op.prev && self.is_insert_known(op.reference())
    }

    /// `incoming` maps the ids of the update being applied to whether they
    /// are inserts.
    fn validate(&self, op: &Operation, incoming: &HashMap<OpId, bool>) -> Result<(), ReplicaError> {
        let malformed = |reason| ReplicaError::MalformedOperation { id: op.id, reason };

        if op.id.counter == 0 || op.id.replica == ROOT_REPLICA {
            return Err(malformed("reserved identifier"));
        }
        if op.prev >= op.id.counter {
            return Err(malformed("previous operation is not earlier"));
        }
        if !self.log.contains_key(&op.id) && self.state_vector.contains(op.id) {
            return Err(malformed("identifier covered by state vector but unknown"));
        }

        let reference = op.reference();
        if reference.is_root() {
            return match op.kind {
                OpKind::Insert { .. } => Ok(()),
                _ => Err(malformed("cannot target the root")),
            };
        }
        if reference.replica == ROOT_REPLICA {
            return Err(malformed("reference uses the root replica"));
        }
        if reference.counter >= op.id.counter {
            return Err(malformed("reference is not causally earlier"));
        }

        let referenced = self
            .log
            .get(&reference)
            .map(|entry| entry.value().is_insert())
            .or_else(|| incoming.get(&reference).copied())
            .or_else(|| self.pending.get(&reference).map(Operation::is_insert));
        match referenced {
            Some(false) => Err(malformed("reference is not an insert")),
            None if self.state_vector.contains(reference) => {
                Err(malformed("reference can never resolve"))
            }
            _ => Ok(()),
        }
    }

    /// Integrates an operation whose dependencies are all present.
    /// Returns whether the visible content changed.
    fn integrate(&mut self, op: &Operation) -> bool {
        self.clock.observe(op.id);
        self.state_vector.observe(op.id);
        self.log.insert(op.id, op.clone());

        match &op.kind {
            OpKind::Insert { after, content } => {
                let Some(mut next) = self.nodes.get(after).map(|anchor| anchor.next) else {
                    return false;
                };
                let mut prev = *after;
                while let Some(sibling) = next.filter(|id| *id > op.id) {
                    prev = sibling;
                    next = self.nodes.get(&sibling).and_then(|n| n.next);
                }

                let mut node = Node::new(op.id, *content);
                node.next = next;
                self.nodes.insert(op.id, node);
                if let Some(before) = self.nodes.get_mut(&prev) {
                    before.next = Some(op.id);
                }
                self.visible += 1;
                true
            }
            OpKind::Delete { target } => {
                let deleted = self.nodes.get_mut(target).is_some_and(Node::delete);
                if deleted {
                    self.visible -= 1;
                }
                deleted
            }
            OpKind::Format { target, key, value } => self
                .nodes
                .get_mut(target)
                .is_some_and(|node| node.set_attribute(key, value.clone(), op.id)),
        }
    }

    /// Integrates buffered operations until none is ready.
    fn release_pending(&mut self) -> Vec<Operation> {
        let mut released = Vec::new();

        loop {
            let ready = self.pending.values().find(|op| self.is_ready(op)).map(|op| op.id);
            let Some(op) = ready.and_then(|id| self.pending.remove(&id)) else {
                break;
            };
            self.integrate(&op);
            released.push(op);
        }

        released
    }

    fn trim_pending(&mut self) {
        let mut dropped = 0;
        while self.pending.len() > self.pending_limit && self.pending.pop_last().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(
                replica = self.replica_id,
                dropped,
                limit = self.pending_limit,
                "pending buffer full, dropping newest operations"
            );
        }
    }
}

impl fmt::Display for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.visible_nodes() {
            write!(f, "{}", node.character)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("replica_id", &self.replica_id)
            .field("clock", &self.clock.current_counter())
            .field("operations", &self.log.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}
