//! Operations, local edits and updates.
//!
//! An [`Operation`] is the unit of replication. Editors never build them
//! directly; they describe a [`LocalEdit`] in visible positions and the
//! replica turns it into operations.

use serde::{Deserialize, Serialize};

use crate::crdt::types::{OpId, StateVector};

/// One atomic content change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique id of this operation
    pub id: OpId,
    /// Counter of the previous operation authored by the same replica, 0 for its first
    pub prev: u64,
    pub kind: OpKind,
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `content` right after the character `after` (or the root).
    Insert { after: OpId, content: char },
    /// Tombstone the character `target`.
    Delete { target: OpId },
    /// Set (`Some`) or unset (`None`) a style attribute on `target`.
    Format {
        target: OpId,
        key: String,
        value: Option<String>,
    },
}

impl Operation {
    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    /// The character this operation refers to: the anchor of an insert or
    /// the target of a delete/format.
    pub fn reference(&self) -> OpId {
        match &self.kind {
            OpKind::Insert { after, .. } => *after,
            OpKind::Delete { target } | OpKind::Format { target, .. } => *target,
        }
    }

    /// The previous operation from the same replica, if any.
    pub fn prev_id(&self) -> Option<OpId> {
        (self.prev != 0).then(|| OpId::new(self.prev, self.id.replica))
    }
}

/// An edit expressed in visible character positions.
///
/// Positions past the end of the document are clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEdit {
    Insert {
        index: usize,
        text: String,
    },
    Delete {
        index: usize,
        len: usize,
    },
    Format {
        index: usize,
        len: usize,
        key: String,
        value: Option<String>,
    },
}

impl LocalEdit {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        LocalEdit::Insert {
            index,
            text: text.into(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        LocalEdit::Delete { index, len }
    }

    pub fn format(index: usize, len: usize, key: impl Into<String>, value: impl Into<String>) -> Self {
        LocalEdit::Format {
            index,
            len,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn unformat(index: usize, len: usize, key: impl Into<String>) -> Self {
        LocalEdit::Format {
            index,
            len,
            key: key.into(),
            value: None,
        }
    }
}

/// A set of operations plus the state vector they were generated against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub context: StateVector,
    pub operations: Vec<Operation>,
}

impl Update {
    pub fn new(context: StateVector, operations: Vec<Operation>) -> Self {
        Update {
            context,
            operations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}
