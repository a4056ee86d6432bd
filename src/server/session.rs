//! One rendezvous websocket connection.
//!
//! A session may join any number of rooms. Negotiation messages are only
//! routed when the sender is a member of the room under the `from` id it
//! claims; everything is dropped from the registry when the socket ends.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::peer::PeerId;
use crate::server::rooms::Rooms;
use crate::signaling::SignalMessage;

pub struct RendezvousSession {
    socket: WebSocket,
    rooms: Rooms,
    session_id: Uuid,
    outbox: mpsc::UnboundedSender<SignalMessage>,
    inbox: mpsc::UnboundedReceiver<SignalMessage>,
    joined: HashMap<String, PeerId>,
}

impl RendezvousSession {
    pub fn new(socket: WebSocket, rooms: Rooms) -> Self {
        let (outbox, inbox) = mpsc::unbounded_channel();
        Self {
            socket,
            rooms,
            session_id: Uuid::new_v4(),
            outbox,
            inbox,
            joined: HashMap::new(),
        }
    }

    /// Runs the session until the socket closes, then leaves every room.
    pub async fn handle(mut self) {
        info!(session = %self.session_id, "signaling session established");

        loop {
            tokio::select! {
                incoming = self.socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                    Some(Ok(Message::Ping(data))) => {
                        if self.socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(session = %self.session_id, error = %err, "websocket error");
                        break;
                    }
                },
                Some(message) = self.inbox.recv() => {
                    if !self.send(&message).await {
                        break;
                    }
                }
            }
        }

        for (room, peer) in std::mem::take(&mut self.joined) {
            self.rooms.leave(&room, peer, self.session_id).await;
        }
        info!(session = %self.session_id, "signaling session ended");
    }

    async fn handle_text(&mut self, text: &str) {
        let message = match SignalMessage::from_json(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "unparseable signaling message");
                self.reject(format!("invalid message: {err}")).await;
                return;
            }
        };

        match message {
            SignalMessage::Join { room, peer } => {
                if let Some(previous) = self.joined.get(&room).copied().filter(|p| *p != peer) {
                    self.rooms.leave(&room, previous, self.session_id).await;
                }
                match self.rooms.join(&room, peer, self.session_id, self.outbox.clone()).await {
                    Ok(peers) => {
                        info!(session = %self.session_id, %room, %peer, "joined room");
                        self.joined.insert(room.clone(), peer);
                        self.send(&SignalMessage::Peers { room, peers }).await;
                    }
                    Err(err) => self.reject(err.to_string()).await,
                }
            }
            SignalMessage::Leave { room, peer } => {
                if self.joined.get(&room) == Some(&peer) {
                    self.joined.remove(&room);
                    self.rooms.leave(&room, peer, self.session_id).await;
                }
            }
            message @ (SignalMessage::Offer { .. }
            | SignalMessage::Answer { .. }
            | SignalMessage::Candidate { .. }) => self.route(message).await,
            SignalMessage::Peers { .. } | SignalMessage::Error { .. } => {
                debug!(session = %self.session_id, "ignoring server-only message");
            }
        }
    }

    async fn route(&mut self, message: SignalMessage) {
        let (Some(room), Some((from, to))) = (message.room().map(str::to_string), message.route()) else {
            return;
        };
        if self.joined.get(&room) != Some(&from) {
            self.reject(format!("not a member of {room} as {from}")).await;
            return;
        }
        if !self.rooms.route(&room, to, message).await {
            debug!(session = %self.session_id, %room, %to, "recipient not in room");
        }
    }

    async fn reject(&mut self, reason: String) {
        self.send(&SignalMessage::Error { message: reason }).await;
    }

    async fn send(&mut self, message: &SignalMessage) -> bool {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(session = %self.session_id, error = %err, "failed to serialize message");
                return true;
            }
        };
        self.socket.send(Message::Text(json)).await.is_ok()
    }
}
