//! Room membership registry of the rendezvous server.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::peer::PeerId;
use crate::signaling::SignalMessage;

/// Queue of messages for one websocket session.
pub type Outbox = mpsc::UnboundedSender<SignalMessage>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("room name must not be empty")]
    EmptyRoom,
    #[error("room {0} is full")]
    Full(String),
}

struct Member {
    session: Uuid,
    outbox: Outbox,
}

/// All rooms and their members, shared between websocket sessions.
#[derive(Clone, Default)]
pub struct Rooms {
    inner: Arc<RwLock<HashMap<String, HashMap<PeerId, Member>>>>,
    /// 0 means unlimited
    max_room_size: usize,
}

impl Rooms {
    pub fn new(max_room_size: usize) -> Self {
        Self {
            inner: Arc::default(),
            max_room_size,
        }
    }

    /// Adds `peer` to `room` and announces it to the other members.
    ///
    /// Returns the members already present. Joining again with the same peer
    /// id (e.g. after a reconnect) replaces the previous session.
    pub async fn join(
        &self,
        room: &str,
        peer: PeerId,
        session: Uuid,
        outbox: Outbox,
    ) -> Result<Vec<PeerId>, JoinError> {
        if room.is_empty() {
            return Err(JoinError::EmptyRoom);
        }
        let mut rooms = self.inner.write().await;
        let members = rooms.entry(room.to_string()).or_default();
        let rejoin = members.contains_key(&peer);
        if !rejoin && self.max_room_size > 0 && members.len() >= self.max_room_size {
            return Err(JoinError::Full(room.to_string()));
        }

        let existing: Vec<PeerId> = members.keys().copied().filter(|p| *p != peer).collect();
        let announce = SignalMessage::Join {
            room: room.to_string(),
            peer,
        };
        for other in &existing {
            if let Some(member) = members.get(other) {
                let _ = member.outbox.send(announce.clone());
            }
        }
        members.insert(peer, Member { session, outbox });
        debug!(room, %peer, members = members.len(), "peer joined");
        Ok(existing)
    }

    /// Removes `peer` from `room` if `session` still owns the membership and
    /// tells the remaining members. Empty rooms are dropped.
    pub async fn leave(&self, room: &str, peer: PeerId, session: Uuid) -> bool {
        let mut rooms = self.inner.write().await;
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        if members.get(&peer).map(|m| m.session) != Some(session) {
            return false;
        }
        members.remove(&peer);

        let announce = SignalMessage::Leave {
            room: room.to_string(),
            peer,
        };
        for member in members.values() {
            let _ = member.outbox.send(announce.clone());
        }
        if members.is_empty() {
            rooms.remove(room);
        }
        debug!(room, %peer, "peer left");
        true
    }

    /// Delivers a negotiation message to `to` in `room`.
    pub async fn route(&self, room: &str, to: PeerId, message: SignalMessage) -> bool {
        let rooms = self.inner.read().await;
        rooms
            .get(room)
            .and_then(|members| members.get(&to))
            .is_some_and(|member| member.outbox.send(message).is_ok())
    }

    pub async fn is_member(&self, room: &str, peer: PeerId, session: Uuid) -> bool {
        let rooms = self.inner.read().await;
        rooms
            .get(room)
            .and_then(|members| members.get(&peer))
            .is_some_and(|member| member.session == session)
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.read().await.values().map(HashMap::len).sum()
    }
}
