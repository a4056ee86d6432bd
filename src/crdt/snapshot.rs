//! Visible content projection handed to the editor surface.

use std::collections::BTreeMap;
use std::fmt;

/// A run of consecutive visible characters sharing the same attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub text: String,
    pub attributes: BTreeMap<String, String>,
}

/// The visible document: ordered spans with tombstones skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub spans: Vec<Span>,
}

impl Snapshot {
    /// Appends one character, extending the last span when attributes match.
    pub(crate) fn push(&mut self, character: char, attributes: BTreeMap<String, String>) {
        match self.spans.last_mut() {
            Some(last) if last.attributes == attributes => last.text.push(character),
            _ => self.spans.push(Span {
                text: character.to_string(),
                attributes,
            }),
        }
    }

    /// Plain text without attributes.
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }

    /// Number of visible characters.
    pub fn len(&self) -> usize {
        self.spans.iter().map(|s| s.text.chars().count()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for span in &self.spans {
            f.write_str(&span.text)?;
        }
        Ok(())
    }
}
