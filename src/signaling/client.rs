//! Room membership over the rendezvous websocket.
//!
//! A [`RoomMembership`] owns one background task that keeps the rendezvous
//! connection alive, runs offer/answer negotiations with the other members
//! and yields every established channel as a [`SignalingEvent::Channel`].
//! Channels already handed out are never touched by signaling failures.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::config::SignalingConfig;
use crate::mesh::{PeerChannel, PeerStream};
use crate::peer::PeerId;
use crate::signaling::backoff::{Backoff, retry};
use crate::signaling::connector::{ConnectError, Connector};
use crate::signaling::protocol::SignalMessage;
use crate::signaling::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Time `leave` waits for the goodbye message to be flushed.
const LEAVE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum SignalingEvent {
    /// The rendezvous accepted our join (again, after a reconnect).
    Connected,
    Channel(PeerChannel),
    /// The rendezvous announced that `0` left the room.
    PeerDeparted(PeerId),
    /// Reconnection gave up or the join was refused; the membership task has
    /// ended.
    Unavailable(SignalingError),
}

enum RoomCommand {
    Release(PeerId),
    Leave,
}

/// Joins rooms on one rendezvous server.
#[derive(Clone)]
pub struct SignalingClient {
    url: String,
    local_peer: PeerId,
    config: SignalingConfig,
    connector: Arc<dyn Connector>,
}

impl SignalingClient {
    pub fn new(
        url: impl Into<String>,
        local_peer: PeerId,
        config: SignalingConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            url: url.into(),
            local_peer,
            config,
            connector,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    /// Starts membership of `room`. Must be called inside a tokio runtime.
    pub fn join(&self, room: &str) -> Result<RoomMembership, SignalingError> {
        if room.is_empty() {
            return Err(SignalingError::EmptyRoom);
        }
        let (events_tx, events) = mpsc::channel(64);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        let task = RoomTask {
            url: self.url.clone(),
            room: room.to_string(),
            local: self.local_peer,
            backoff: Backoff::from_config(&self.config),
            negotiation_timeout: self.config.negotiation_timeout(),
            connector: Arc::clone(&self.connector),
            events: events_tx,
            commands: commands_rx,
            outgoing_tx,
            outgoing_rx,
            joined: false,
            members: HashSet::new(),
            connected: HashSet::new(),
            negotiating: HashSet::new(),
            awaiting_answer: HashMap::new(),
            negotiations: JoinSet::new(),
            retries: JoinSet::new(),
            failures: HashMap::new(),
        };
        info!(room, peer = %self.local_peer, "joining room");
        Ok(RoomMembership {
            room: room.to_string(),
            events,
            commands,
            task: tokio::spawn(task.run()),
        })
    }
}

/// A live membership; dropping it leaves the room without a goodbye.
pub struct RoomMembership {
    room: String,
    events: mpsc::Receiver<SignalingEvent>,
    commands: mpsc::UnboundedSender<RoomCommand>,
    task: JoinHandle<()>,
}

impl RoomMembership {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub async fn next_event(&mut self) -> Option<SignalingEvent> {
        self.events.recv().await
    }

    /// Forgets the channel to `peer` so it can be negotiated again.
    pub fn release(&self, peer: PeerId) {
        let _ = self.commands.send(RoomCommand::Release(peer));
    }

    /// Announces departure and stops all signaling work for this room.
    /// Every in-flight negotiation is cancelled when this returns.
    pub async fn leave(mut self) {
        let _ = self.commands.send(RoomCommand::Leave);
        if tokio::time::timeout(LEAVE_GRACE, &mut self.task).await.is_err() {
            self.task.abort();
        }
    }
}

impl Drop for RoomMembership {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum SessionEnd {
    Left,
    Disconnected,
}

type NegotiationResult = (PeerId, Result<PeerStream, ConnectError>);

struct RoomTask {
    url: String,
    room: String,
    local: PeerId,
    backoff: Backoff,
    negotiation_timeout: Duration,
    connector: Arc<dyn Connector>,
    events: mpsc::Sender<SignalingEvent>,
    commands: mpsc::UnboundedReceiver<RoomCommand>,
    outgoing_tx: mpsc::UnboundedSender<SignalMessage>,
    outgoing_rx: mpsc::UnboundedReceiver<SignalMessage>,
    /// Whether the current session's join was answered with a roster.
    joined: bool,
    members: HashSet<PeerId>,
    connected: HashSet<PeerId>,
    negotiating: HashSet<PeerId>,
    awaiting_answer: HashMap<PeerId, oneshot::Sender<String>>,
    negotiations: JoinSet<NegotiationResult>,
    retries: JoinSet<PeerId>,
    failures: HashMap<PeerId, u32>,
}

impl RoomTask {
    async fn run(mut self) {
        loop {
            let url = self.url.clone();
            let connection = retry(&self.backoff, |attempt| {
                debug!(attempt, url = %url, "connecting to rendezvous");
                connect_async(url.clone())
            })
            .await;

            let ws = match connection {
                Ok((ws, _)) => ws,
                Err(err) => {
                    let _ = self.events.send(SignalingEvent::Unavailable(err)).await;
                    return;
                }
            };

            match self.session(ws).await {
                SessionEnd::Left => return,
                SessionEnd::Disconnected => {
                    warn!(room = %self.room, "lost rendezvous connection, reconnecting");
                }
            }
        }
    }

    async fn session(&mut self, ws: WsStream) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        self.members.clear();
        self.joined = false;

        let join = SignalMessage::Join {
            room: self.room.clone(),
            peer: self.local,
        };
        if send_signal(&mut sink, &join).await.is_err() {
            return SessionEnd::Disconnected;
        }
        debug!(room = %self.room, "join sent, waiting for roster");

        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match SignalMessage::from_json(&text) {
                        Ok(message) => {
                            if let Some(end) = self.handle_signal(message).await {
                                return end;
                            }
                        }
                        Err(err) => warn!(error = %err, "ignoring invalid signaling message"),
                    },
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "rendezvous connection error");
                        return SessionEnd::Disconnected;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(RoomCommand::Release(peer)) => self.release(peer),
                    Some(RoomCommand::Leave) | None => {
                        let leave = SignalMessage::Leave {
                            room: self.room.clone(),
                            peer: self.local,
                        };
                        let _ = send_signal(&mut sink, &leave).await;
                        let _ = sink.close().await;
                        info!(room = %self.room, "left room");
                        return SessionEnd::Left;
                    }
                },
                Some(message) = self.outgoing_rx.recv() => {
                    if send_signal(&mut sink, &message).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                Some(done) = self.negotiations.join_next() => {
                    if let Ok((peer, result)) = done {
                        if !self.negotiation_finished(peer, result).await {
                            return SessionEnd::Left;
                        }
                    }
                }
                Some(Ok(peer)) = self.retries.join_next() => self.maybe_offer(peer),
            }
        }
    }

    /// Returns the reason to end the session, if any.
    async fn handle_signal(&mut self, message: SignalMessage) -> Option<SessionEnd> {
        if message.room().is_some_and(|room| room != self.room) {
            return None;
        }
        if let Some((_, to)) = message.route() {
            if to != self.local {
                return None;
            }
        }

        match message {
            SignalMessage::Peers { peers, .. } => {
                debug!(count = peers.len(), "received room roster");
                if !self.joined {
                    self.joined = true;
                    info!(room = %self.room, "connected to rendezvous");
                    if self.events.send(SignalingEvent::Connected).await.is_err() {
                        return Some(SessionEnd::Left);
                    }
                }
                let local = self.local;
                for peer in peers.into_iter().filter(|peer| *peer != local) {
                    self.members.insert(peer);
                    self.maybe_offer(peer);
                }
            }
            SignalMessage::Join { peer, .. } if peer != self.local => {
                info!(%peer, "peer joined room");
                self.members.insert(peer);
                self.maybe_offer(peer);
            }
            SignalMessage::Offer { from, sdp, .. } => {
                if self.initiates(from) {
                    debug!(%from, "ignoring offer from peer we initiate to");
                    return None;
                }
                self.members.insert(from);
                self.negotiating.insert(from);
                self.negotiations.spawn(respond(
                    Arc::clone(&self.connector),
                    self.outgoing_tx.clone(),
                    self.room.clone(),
                    self.local,
                    from,
                    sdp,
                    self.negotiation_timeout,
                ));
            }
            SignalMessage::Answer { from, sdp, .. } => match self.awaiting_answer.remove(&from) {
                Some(reply) => {
                    let _ = reply.send(sdp);
                }
                None => debug!(%from, "unexpected answer"),
            },
            SignalMessage::Candidate { from, candidate, .. } => {
                self.connector.remote_candidate(from, &candidate).await;
            }
            SignalMessage::Leave { peer, .. } => {
                info!(%peer, "peer left room");
                self.members.remove(&peer);
                self.awaiting_answer.remove(&peer);
                self.failures.remove(&peer);
                if self.events.send(SignalingEvent::PeerDeparted(peer)).await.is_err() {
                    return Some(SessionEnd::Left);
                }
            }
            // The server answers messages in order, so an error before the
            // roster is the answer to our join.
            SignalMessage::Error { message } if !self.joined => {
                warn!(room = %self.room, reason = %message, "rendezvous refused join");
                let refused = SignalingEvent::Unavailable(SignalingError::Rejected(message));
                let _ = self.events.send(refused).await;
                return Some(SessionEnd::Left);
            }
            SignalMessage::Error { message } => warn!(reason = %message, "rendezvous rejected request"),
            SignalMessage::Join { .. } => {}
        }
        None
    }

    /// The member with the smaller id initiates.
    fn initiates(&self, peer: PeerId) -> bool {
        self.local < peer
    }

    fn maybe_offer(&mut self, peer: PeerId) {
        if !self.initiates(peer)
            || !self.members.contains(&peer)
            || self.connected.contains(&peer)
            || self.negotiating.contains(&peer)
        {
            return;
        }
        let (reply, answer) = oneshot::channel();
        self.awaiting_answer.insert(peer, reply);
        self.negotiating.insert(peer);
        self.negotiations.spawn(initiate(
            Arc::clone(&self.connector),
            self.outgoing_tx.clone(),
            self.room.clone(),
            self.local,
            peer,
            answer,
            self.negotiation_timeout,
        ));
    }

    fn release(&mut self, peer: PeerId) {
        if self.connected.remove(&peer) {
            debug!(%peer, "channel released");
        }
        self.maybe_offer(peer);
    }

    /// Returns false when the event consumer is gone.
    async fn negotiation_finished(&mut self, peer: PeerId, result: Result<PeerStream, ConnectError>) -> bool {
        self.negotiating.remove(&peer);
        self.awaiting_answer.remove(&peer);
        match result {
            Ok(stream) => {
                info!(%peer, "peer channel negotiated");
                self.failures.remove(&peer);
                self.connected.insert(peer);
                let channel = PeerChannel::new(peer, stream);
                self.events.send(SignalingEvent::Channel(channel)).await.is_ok()
            }
            Err(err) => {
                warn!(%peer, error = %err, "negotiation failed");
                if self.initiates(peer) && self.members.contains(&peer) {
                    let failures = self.failures.entry(peer).or_insert(0);
                    *failures += 1;
                    if *failures < self.backoff.max_attempts {
                        let delay = self.backoff.delay(*failures);
                        self.retries.spawn(async move {
                            tokio::time::sleep(delay).await;
                            peer
                        });
                    } else {
                        warn!(%peer, "giving up on peer until it rejoins");
                    }
                }
                true
            }
        }
    }
}

async fn send_signal(sink: &mut WsSink, message: &SignalMessage) -> Result<(), SignalingError> {
    let text = message.to_json()?;
    sink.send(Message::Text(text))
        .await
        .map_err(|err| SignalingError::WebSocket(Box::new(err)))
}

async fn initiate(
    connector: Arc<dyn Connector>,
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    room: String,
    local: PeerId,
    remote: PeerId,
    answer: oneshot::Receiver<String>,
    timeout: Duration,
) -> NegotiationResult {
    let negotiation = async {
        let pending = connector.offer(remote).await?;
        let offer = SignalMessage::Offer {
            room: room.clone(),
            from: local,
            to: remote,
            sdp: pending.sdp(),
        };
        outgoing.send(offer).map_err(|_| ConnectError::Cancelled)?;
        for candidate in pending.candidates() {
            let message = SignalMessage::Candidate {
                room: room.clone(),
                from: local,
                to: remote,
                candidate,
            };
            outgoing.send(message).map_err(|_| ConnectError::Cancelled)?;
        }
        let answer_sdp = answer.await.map_err(|_| ConnectError::Cancelled)?;
        pending.complete(&answer_sdp).await
    };
    let result = tokio::time::timeout(timeout, negotiation)
        .await
        .unwrap_or(Err(ConnectError::Timeout));
    (remote, result)
}

async fn respond(
    connector: Arc<dyn Connector>,
    outgoing: mpsc::UnboundedSender<SignalMessage>,
    room: String,
    local: PeerId,
    remote: PeerId,
    offer_sdp: String,
    timeout: Duration,
) -> NegotiationResult {
    let negotiation = async {
        let pending = connector.answer(remote, &offer_sdp).await?;
        let answer = SignalMessage::Answer {
            room,
            from: local,
            to: remote,
            sdp: pending.sdp(),
        };
        outgoing.send(answer).map_err(|_| ConnectError::Cancelled)?;
        pending.connected().await
    };
    let result = tokio::time::timeout(timeout, negotiation)
        .await
        .unwrap_or(Err(ConnectError::Timeout));
    (remote, result)
}
