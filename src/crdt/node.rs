//! Node definition for the replica sequence.
//!
//! This module contains the Node struct which represents individual characters
//! in the document sequence, including tombstones and the root sentinel.

use std::collections::BTreeMap;

use crate::crdt::types::OpId;

/// Placeholder character held by the root sentinel node.
///
/// Chosen from Unicode's "Miscellaneous Technical" block so it never collides
/// with document text. It is never part of the visible content.
pub const SENTINEL_ROOT_CHAR: char = '\u{2388}';

/// Last-writer-wins value of one style attribute on one character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeValue {
    pub value: Option<String>,
    /// Id of the format operation that wrote this value
    pub written_by: OpId,
}

/// Represents a single character within the sequence.
///
/// # Tombstone Deletion
///
/// Deleted characters are never removed. They keep their place so that
/// concurrent inserts anchored on them still resolve to the same position on
/// every replica.
#[derive(Debug, Clone)]
pub struct Node {
    /// Id of the insert operation that created this node
    pub id: OpId,
    /// The character content of this node
    pub character: char,
    /// Whether this node has been logically deleted (tombstone)
    pub is_deleted: bool,
    pub attributes: BTreeMap<String, AttributeValue>,
    /// The node that follows in document order
    pub next: Option<OpId>,
}

impl Node {
    /// Creates a new live node with no attributes.
    pub fn new(id: OpId, character: char) -> Self {
        Node {
            id,
            character,
            is_deleted: false,
            attributes: BTreeMap::new(),
            next: None,
        }
    }

    /// Creates the root sentinel node.
    pub fn root() -> Self {
        Node::new(OpId::ROOT, SENTINEL_ROOT_CHAR)
    }

    pub fn is_sentinel(&self) -> bool {
        self.id.is_root()
    }

    /// Returns true if this node is visible (not deleted and not the root).
    pub fn is_visible(&self) -> bool {
        !self.is_deleted && !self.is_sentinel()
    }

    /// Marks this node as deleted. Returns whether the visible content changed.
    pub fn delete(&mut self) -> bool {
        if self.is_sentinel() || self.is_deleted {
            return false;
        }
        self.is_deleted = true;
        true
    }

    /// Applies a format write if it is newer than the current one for `key`.
    /// Returns whether the stored value changed.
    pub fn set_attribute(&mut self, key: &str, value: Option<String>, written_by: OpId) -> bool {
        match self.attributes.get_mut(key) {
            Some(current) if current.written_by >= written_by => false,
            Some(current) => {
                let changed = current.value != value;
                current.value = value;
                current.written_by = written_by;
                changed
            }
            None => {
                let changed = value.is_some();
                self.attributes
                    .insert(key.to_string(), AttributeValue { value, written_by });
                changed
            }
        }
    }

    /// The attributes currently set on this node.
    pub fn visible_attributes(&self) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .filter_map(|(key, attr)| attr.value.clone().map(|v| (key.clone(), v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_deletion() {
        let mut node = Node::new(OpId::new(1, 1), 'A');
        assert!(node.is_visible());
        assert!(node.delete());
        assert!(node.is_deleted);
        assert!(!node.is_visible());
        // Deleting twice has no further effect
        assert!(!node.delete());
    }

    #[test]
    fn test_root_cannot_be_deleted() {
        let mut root = Node::root();
        assert!(root.is_sentinel());
        assert!(!root.is_visible());
        assert!(!root.delete());
        assert!(!root.is_deleted);
    }

    #[test]
    fn test_attribute_last_writer_wins() {
        let mut node = Node::new(OpId::new(1, 1), 'A');

        assert!(node.set_attribute("bold", Some("true".into()), OpId::new(5, 2)));
        // An older write loses regardless of arrival order
        assert!(!node.set_attribute("bold", None, OpId::new(4, 9)));
        assert_eq!(node.visible_attributes().get("bold").map(String::as_str), Some("true"));

        // A newer unset wins
        assert!(node.set_attribute("bold", None, OpId::new(6, 1)));
        assert!(node.visible_attributes().is_empty());
    }
}
