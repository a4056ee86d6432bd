//! Awareness: ephemeral per-peer presence with liveness expiry.
//!
//! Each peer owns exactly one state and a version counter. States are never
//! merged: a newer version replaces the previous state wholesale, and older
//! or equal versions are dropped, so out-of-order delivery cannot resurrect
//! stale presence. Peers that stop refreshing their state disappear after the
//! timeout, which is how a peer that vanished without a goodbye is cleaned up.
//!
//! ```text
//! set_local() ──► AwarenessUpdate ──► broadcast ──► apply_remote() on peers
//!                                                        │
//!                     expire(now) ◄── no refresh within timeout
//! ```

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Opaque presence payload tagged with an application schema version.
///
/// Only the presentation layer interprets `payload`; the table compares
/// states by bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub schema: u16,
    pub payload: Vec<u8>,
}

impl AwarenessState {
    pub fn new(schema: u16, payload: Vec<u8>) -> Self {
        Self { schema, payload }
    }

    /// Builds a state from any serializable value, encoded as JSON.
    pub fn from_json<T: Serialize>(schema: u16, value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            schema,
            payload: serde_json::to_vec(value)?,
        })
    }

    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Cursor or selection in visible character positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub anchor: usize,
    pub head: usize,
}

/// The built-in presence schema: who is here and where their cursor is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub name: String,
    /// CSS-style color, e.g. `#3a7bd5`
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<CursorRange>,
}

impl UserPresence {
    pub const SCHEMA: u16 = 1;

    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            cursor: None,
        }
    }

    /// A random `UserNNN` name and color, as handed out on joining a room.
    pub fn random() -> Self {
        let number: u16 = rand::random::<u16>() % 1000;
        let color: u32 = rand::random::<u32>() & 0x00ff_ffff;
        Self::new(format!("User{number}"), format!("#{color:06x}"))
    }

    pub fn to_state(&self) -> AwarenessState {
        AwarenessState {
            schema: Self::SCHEMA,
            // Serializing plain strings and integers cannot fail
            payload: serde_json::to_vec(self).unwrap_or_default(),
        }
    }

    /// Reads a state written with this schema; `None` for other schemas.
    pub fn from_state(state: &AwarenessState) -> Option<Self> {
        if state.schema != Self::SCHEMA {
            return None;
        }
        state.to_json().ok()
    }
}

/// One versioned presence message. `state: None` announces departure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub peer: PeerId,
    pub version: u64,
    pub state: Option<AwarenessState>,
}

/// Which peers an applied message or an expiry pass affected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<PeerId>,
    pub updated: Vec<PeerId>,
    pub removed: Vec<PeerId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn merge(&mut self, other: AwarenessChange) {
        self.added.extend(other.added);
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }
}

#[derive(Debug, Clone)]
struct Entry {
    state: AwarenessState,
    version: u64,
    last_updated: Instant,
}

/// Presence map for every known peer, including the local one.
#[derive(Debug)]
pub struct AwarenessTable {
    local_peer: PeerId,
    timeout: Duration,
    entries: HashMap<PeerId, Entry>,
    /// Last version seen per peer, kept after removal so stale messages
    /// cannot bring an expired entry back
    versions: HashMap<PeerId, u64>,
}

impl AwarenessTable {
    pub fn new(local_peer: PeerId, timeout: Duration) -> Self {
        Self {
            local_peer,
            timeout,
            entries: HashMap::new(),
            versions: HashMap::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn next_local_version(&mut self) -> u64 {
        let version = self.versions.get(&self.local_peer).copied().unwrap_or(0) + 1;
        self.versions.insert(self.local_peer, version);
        version
    }

    /// Replaces the local state and returns the message to broadcast.
    pub fn set_local(&mut self, state: AwarenessState, now: Instant) -> AwarenessUpdate {
        let version = self.next_local_version();
        self.entries.insert(
            self.local_peer,
            Entry {
                state: state.clone(),
                version,
                last_updated: now,
            },
        );
        AwarenessUpdate {
            peer: self.local_peer,
            version,
            state: Some(state),
        }
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.entries.get(&self.local_peer).map(|e| &e.state)
    }

    /// Re-announces the local state once half the timeout has elapsed, so
    /// remote tables keep seeing this peer as alive.
    pub fn renew_local(&mut self, now: Instant) -> Option<AwarenessUpdate> {
        let entry = self.entries.get(&self.local_peer)?;
        if now.saturating_duration_since(entry.last_updated) < self.timeout / 2 {
            return None;
        }
        let state = entry.state.clone();
        Some(self.set_local(state, now))
    }

    /// Drops the local state and returns the departure message.
    pub fn clear_local(&mut self) -> AwarenessUpdate {
        let version = self.next_local_version();
        self.entries.remove(&self.local_peer);
        AwarenessUpdate {
            peer: self.local_peer,
            version,
            state: None,
        }
    }

    /// Applies a remote message if its version is newer than anything seen
    /// for that peer.
    ///
    /// Returns `None` when the message was stale or about the local peer, in
    /// which case it must not be relayed. An applied heartbeat that changed
    /// nothing returns an empty change.
    pub fn apply_remote(&mut self, update: &AwarenessUpdate, now: Instant) -> Option<AwarenessChange> {
        if update.peer == self.local_peer {
            return None;
        }
        if self
            .versions
            .get(&update.peer)
            .is_some_and(|&known| update.version <= known)
        {
            return None;
        }
        self.versions.insert(update.peer, update.version);

        let mut change = AwarenessChange::default();
        match &update.state {
            Some(state) => {
                let previous = self.entries.insert(
                    update.peer,
                    Entry {
                        state: state.clone(),
                        version: update.version,
                        last_updated: now,
                    },
                );
                match previous {
                    None => change.added.push(update.peer),
                    Some(prev) if prev.state != *state => change.updated.push(update.peer),
                    Some(_) => {}
                }
            }
            None => {
                if self.entries.remove(&update.peer).is_some() {
                    change.removed.push(update.peer);
                }
            }
        }
        Some(change)
    }

    /// Removes remote entries not refreshed within the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let timeout = self.timeout;
        let local = self.local_peer;
        let expired: Vec<PeerId> = self
            .entries
            .iter()
            .filter(|(peer, entry)| {
                **peer != local && now.saturating_duration_since(entry.last_updated) >= timeout
            })
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            self.entries.remove(peer);
        }
        expired
    }

    /// Forgets every remote entry, e.g. after leaving a room.
    pub fn clear_remote(&mut self) -> Vec<PeerId> {
        let local = self.local_peer;
        let removed: Vec<PeerId> = self.entries.keys().filter(|p| **p != local).copied().collect();
        self.entries.retain(|peer, _| *peer == local);
        removed
    }

    /// Removes the given remote peers; returns those that had an entry.
    pub fn remove_peers(&mut self, peers: &[PeerId]) -> Vec<PeerId> {
        let local = self.local_peer;
        peers
            .iter()
            .filter(|peer| **peer != local)
            .filter(|peer| self.entries.remove(*peer).is_some())
            .copied()
            .collect()
    }

    /// Every current entry as a message, for answering a full-state query.
    pub fn full_state(&self) -> Vec<AwarenessUpdate> {
        self.entries
            .iter()
            .map(|(peer, entry)| AwarenessUpdate {
                peer: *peer,
                version: entry.version,
                state: Some(entry.state.clone()),
            })
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<PeerId, AwarenessState> {
        self.entries
            .iter()
            .map(|(peer, entry)| (*peer, entry.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
