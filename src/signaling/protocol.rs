//! Signaling wire protocol: JSON text frames exchanged with the rendezvous.

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Messages between a signaling client and the rendezvous server.
///
/// `join`, `leave` and the roster reply `peers` manage room membership;
/// `offer`, `answer` and `candidate` are routed by the server to the member
/// named in `to`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Join {
        room: String,
        peer: PeerId,
    },
    /// Sent to a joining member: everyone already in the room.
    Peers {
        room: String,
        peers: Vec<PeerId>,
    },
    Offer {
        room: String,
        from: PeerId,
        to: PeerId,
        sdp: String,
    },
    Answer {
        room: String,
        from: PeerId,
        to: PeerId,
        sdp: String,
    },
    Candidate {
        room: String,
        from: PeerId,
        to: PeerId,
        candidate: String,
    },
    Leave {
        room: String,
        peer: PeerId,
    },
    /// Server-side rejection of the previous message.
    Error {
        message: String,
    },
}

impl SignalMessage {
    pub fn room(&self) -> Option<&str> {
        match self {
            SignalMessage::Join { room, .. }
            | SignalMessage::Peers { room, .. }
            | SignalMessage::Offer { room, .. }
            | SignalMessage::Answer { room, .. }
            | SignalMessage::Candidate { room, .. }
            | SignalMessage::Leave { room, .. } => Some(room),
            SignalMessage::Error { .. } => None,
        }
    }

    /// Sender and recipient of a routed negotiation message.
    pub fn route(&self) -> Option<(PeerId, PeerId)> {
        match self {
            SignalMessage::Offer { from, to, .. }
            | SignalMessage::Answer { from, to, .. }
            | SignalMessage::Candidate { from, to, .. } => Some((*from, *to)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_wire_shape() {
        let peer = PeerId::random();
        let json = SignalMessage::Join {
            room: "notes".into(),
            peer,
        }
        .to_json()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "join");
        assert_eq!(value["room"], "notes");
        assert_eq!(value["peer"], peer.to_string());
    }

    #[test]
    fn test_route_and_room() {
        let (a, b) = (PeerId::random(), PeerId::random());
        let offer = SignalMessage::Offer {
            room: "r".into(),
            from: a,
            to: b,
            sdp: "tcp 127.0.0.1:1 x".into(),
        };
        assert_eq!(offer.route(), Some((a, b)));
        assert_eq!(offer.room(), Some("r"));

        let parsed = SignalMessage::from_json(&offer.to_json().unwrap()).unwrap();
        assert_eq!(parsed, offer);
        assert!(SignalMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    }
}
