//! The sync orchestrator: one event loop that owns the replica, the
//! awareness table, the peer mesh and the room membership.
//!
//! All mutations are serialized through the loop. Handles send commands over
//! an mpsc channel and read snapshots through shared read locks, so editor
//! code never waits on the network.
//!
//! ```text
//!  SyncHandle ──commands──►┐
//!  PeerMesh   ──frames────►├──► select! loop ──► Replica / AwarenessTable
//!  RoomMembership ─events─►┤                └──► SyncEvent broadcast
//!  interval tick ─────────►┘
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::awareness::{AwarenessChange, AwarenessState, AwarenessTable, AwarenessUpdate};
use crate::codec::{PeerMessage, decode_message, encode_message};
use crate::config::SyncConfig;
use crate::crdt::{LocalEdit, Replica, ReplicaId, Snapshot, StateVector, Update, random_replica_id};
use crate::error::{Result, SyncError};
use crate::mesh::{ChannelError, MeshEvent, PeerMesh};
use crate::peer::PeerId;
use crate::signaling::{Connector, RoomMembership, SignalingClient, SignalingEvent};

/// Time writers get to flush goodbye frames on disconnect.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The document may have changed; re-read the snapshot.
    DocumentChanged,
    AwarenessChanged(AwarenessChange),
    /// The rendezvous accepted the join.
    RoomConnected { room: String },
    RoomConnectFailed { room: String, reason: String },
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Disconnected { room: String },
}

enum Command {
    Edit {
        edit: LocalEdit,
        reply: oneshot::Sender<Update>,
    },
    SetAwareness {
        state: AwarenessState,
        reply: oneshot::Sender<()>,
    },
    Connect {
        room: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable access to a running orchestrator.
#[derive(Clone)]
pub struct SyncHandle {
    peer_id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SyncEvent>,
    replica: Arc<RwLock<Replica>>,
    awareness: Arc<RwLock<AwarenessTable>>,
}

impl SyncHandle {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica.read().replica_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.replica.read().snapshot()
    }

    pub fn text(&self) -> String {
        self.replica.read().to_string()
    }

    pub fn state_vector(&self) -> StateVector {
        self.replica.read().state_vector().clone()
    }

    pub fn awareness_snapshot(&self) -> BTreeMap<PeerId, AwarenessState> {
        self.awareness.read().snapshot()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::Shutdown)?;
        response.await.map_err(|_| SyncError::Shutdown)
    }

    /// Applies an edit locally and broadcasts it. Returns the generated
    /// operations.
    pub async fn apply_local(&self, edit: LocalEdit) -> Result<Update> {
        self.request(|reply| Command::Edit { edit, reply }).await
    }

    pub async fn set_awareness(&self, state: AwarenessState) -> Result<()> {
        self.request(|reply| Command::SetAwareness { state, reply }).await
    }

    /// Joins `room`. Joining the current room again does nothing; joining a
    /// different one leaves the current room first.
    pub async fn connect(&self, room: &str) -> Result<()> {
        let room = room.to_string();
        self.request(|reply| Command::Connect { room, reply }).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Peers with an open channel.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        self.request(|reply| Command::Peers { reply }).await
    }

    /// Leaves the room and stops the event loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    peer_id: PeerId,
    replica: Arc<RwLock<Replica>>,
    awareness: Arc<RwLock<AwarenessTable>>,
    local_presence: Option<AwarenessState>,
    mesh: PeerMesh,
    mesh_events: mpsc::Receiver<MeshEvent>,
    signaling: SignalingClient,
    membership: Option<RoomMembership>,
    room: Option<String>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncOrchestrator {
    /// Starts an orchestrator with a fresh replica and random identities.
    pub fn spawn(config: SyncConfig, connector: Arc<dyn Connector>) -> SyncHandle {
        Self::spawn_with(config, connector, Replica::new(random_replica_id()), PeerId::random())
    }

    /// Starts an orchestrator around an existing replica.
    pub fn spawn_with(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        replica: Replica,
        peer_id: PeerId,
    ) -> SyncHandle {
        let (commands_tx, commands) = mpsc::channel(64);
        let (events, _) = broadcast::channel(256);
        let replica = Arc::new(RwLock::new(replica));
        let awareness = Arc::new(RwLock::new(AwarenessTable::new(
            peer_id,
            config.awareness.timeout(),
        )));
        let (mesh, mesh_events) = PeerMesh::new(config.mesh.clone());
        let signaling = SignalingClient::new(
            config.signaling_url.clone(),
            peer_id,
            config.signaling.clone(),
            connector,
        );

        let orchestrator = SyncOrchestrator {
            config,
            peer_id,
            replica: Arc::clone(&replica),
            awareness: Arc::clone(&awareness),
            local_presence: None,
            mesh,
            mesh_events,
            signaling,
            membership: None,
            room: None,
            commands,
            events: events.clone(),
        };
        tokio::spawn(orchestrator.run());

        SyncHandle {
            peer_id,
            commands: commands_tx,
            events,
            replica,
            awareness,
        }
    }

    async fn run(mut self) {
        info!(peer = %self.peer_id, "sync engine started");
        let mut tick = tokio::time::interval(self.config.awareness.check_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.disconnect().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect().await;
                        break;
                    }
                },
                Some(event) = self.mesh_events.recv() => self.handle_mesh_event(event),
                event = next_signaling_event(&mut self.membership) => self.handle_signaling_event(event),
                _ = tick.tick() => self.on_tick(),
            }
        }
        info!(peer = %self.peer_id, "sync engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Edit { edit, reply } => {
                let update = self.replica.write().apply_local(edit);
                if !update.is_empty() {
                    self.emit(SyncEvent::DocumentChanged);
                    self.broadcast(&PeerMessage::Update(update.clone()), None);
                }
                let _ = reply.send(update);
            }
            Command::SetAwareness { state, reply } => {
                self.local_presence = Some(state.clone());
                self.announce_presence(state);
                let _ = reply.send(());
            }
            Command::Connect { room, reply } => {
                let _ = reply.send(self.connect(room).await);
            }
            Command::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.mesh.open_peers());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn announce_presence(&mut self, state: AwarenessState) {
        let update = self.awareness.write().set_local(state, now());
        self.emit(SyncEvent::AwarenessChanged(AwarenessChange {
            updated: vec![self.peer_id],
            ..Default::default()
        }));
        self.broadcast(&PeerMessage::Awareness(vec![update]), None);
    }

    async fn connect(&mut self, room: String) -> Result<()> {
        if room.is_empty() {
            return Err(SyncError::EmptyRoom);
        }
        if self.room.as_deref() == Some(room.as_str()) && self.membership.is_some() {
            return Ok(());
        }
        if self.room.as_ref().is_some_and(|current| *current != room) {
            self.disconnect().await;
        }

        let membership = self.signaling.join(&room)?;
        self.membership = Some(membership);
        self.room = Some(room);
        if let Some(state) = self.local_presence.clone() {
            if self.awareness.read().local_state().is_none() {
                self.announce_presence(state);
            }
        }
        Ok(())
    }

    /// Leaves the current room. Announces departure to the peers, then closes
    /// every channel.
    async fn disconnect(&mut self) {
        let Some(room) = self.room.take() else {
            return;
        };
        info!(%room, "disconnecting");

        let goodbye = {
            let mut awareness = self.awareness.write();
            awareness.local_state().is_some().then(|| awareness.clear_local())
        };
        if let Some(goodbye) = goodbye {
            self.broadcast(&PeerMessage::Awareness(vec![goodbye]), None);
        }

        if let Some(membership) = self.membership.take() {
            membership.leave().await;
        }
        for peer in self.mesh.shutdown(CLOSE_GRACE).await {
            self.emit(SyncEvent::PeerLeft(peer));
        }

        let removed = self.awareness.write().clear_remote();
        if !removed.is_empty() || self.local_presence.is_some() {
            let mut change = AwarenessChange {
                removed,
                ..Default::default()
            };
            if self.local_presence.is_some() {
                change.removed.push(self.peer_id);
            }
            self.emit(SyncEvent::AwarenessChanged(change));
        }
        self.emit(SyncEvent::Disconnected { room });
    }

    fn handle_signaling_event(&mut self, event: Option<SignalingEvent>) {
        let room = self.room.clone().unwrap_or_default();
        match event {
            Some(SignalingEvent::Connected) => {
                info!(%room, "room connected");
                self.emit(SyncEvent::RoomConnected { room });
            }
            Some(SignalingEvent::Channel(channel)) => {
                let peer = self.mesh.attach(channel);
                self.emit(SyncEvent::PeerJoined(peer));

                let sv = self.replica.read().state_vector().clone();
                self.send_to(peer, &PeerMessage::SyncStep1(sv));
                self.send_to(peer, &PeerMessage::AwarenessQuery);
            }
            Some(SignalingEvent::PeerDeparted(peer)) => {
                let removed = self.awareness.write().remove_peers(&[peer]);
                if !removed.is_empty() {
                    debug!(%peer, "dropping presence of departed peer");
                    self.emit(SyncEvent::AwarenessChanged(AwarenessChange {
                        removed,
                        ..Default::default()
                    }));
                }
            }
            Some(SignalingEvent::Unavailable(err)) => {
                warn!(%room, error = %err, "signaling unavailable");
                self.membership = None;
                self.emit(SyncEvent::RoomConnectFailed {
                    room,
                    reason: err.to_string(),
                });
            }
            None => {
                debug!(%room, "signaling task ended");
                self.membership = None;
            }
        }
    }

    fn handle_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Frame { peer, bytes } => match decode_message(&bytes) {
                Ok(message) => {
                    self.mesh.record_decode_success(peer);
                    self.handle_peer_message(peer, message);
                }
                Err(err) => {
                    warn!(%peer, error = %err, "undecodable frame");
                    if self.mesh.record_decode_failure(peer) {
                        self.peer_left(peer);
                    }
                }
            },
            MeshEvent::Closed {
                peer,
                generation,
                error,
            } => {
                if let Some(err) = &error {
                    warn!(%peer, error = %err, "peer channel ended with error");
                }
                if self.mesh.on_closed(peer, generation, error.as_ref()) {
                    self.peer_left(peer);
                }
            }
        }
    }

    fn handle_peer_message(&mut self, from: PeerId, message: PeerMessage) {
        debug!(peer = %from, kind = message.kind(), "peer message");
        match message {
            PeerMessage::SyncStep1(remote) => {
                let diff = self.replica.read().diff_since(&remote);
                self.send_to(from, &PeerMessage::SyncStep2(diff));
            }
            PeerMessage::SyncStep2(update) | PeerMessage::Update(update) => {
                self.apply_remote_update(from, &update);
            }
            PeerMessage::Awareness(updates) => self.apply_remote_awareness(from, updates),
            PeerMessage::AwarenessQuery => {
                let full = self.awareness.read().full_state();
                if !full.is_empty() {
                    self.send_to(from, &PeerMessage::Awareness(full));
                }
            }
        }
    }

    fn apply_remote_update(&mut self, from: PeerId, update: &Update) {
        let result = self.replica.write().apply_remote(update);
        match result {
            Ok(new) if new.is_empty() => {}
            Ok(new) => {
                debug!(peer = %from, ops = new.len(), "integrated remote operations");
                self.emit(SyncEvent::DocumentChanged);
                self.broadcast(&PeerMessage::Update(new), Some(from));
            }
            Err(err) => warn!(peer = %from, error = %err, "rejected update"),
        }
    }

    fn apply_remote_awareness(&mut self, from: PeerId, updates: Vec<AwarenessUpdate>) {
        let now = now();
        let mut change = AwarenessChange::default();
        let mut relay = Vec::new();
        {
            let mut awareness = self.awareness.write();
            for update in updates {
                if let Some(applied) = awareness.apply_remote(&update, now) {
                    change.merge(applied);
                    relay.push(update);
                }
            }
        }
        if !relay.is_empty() {
            self.broadcast(&PeerMessage::Awareness(relay), Some(from));
        }
        if !change.is_empty() {
            self.emit(SyncEvent::AwarenessChanged(change));
        }
    }

    fn on_tick(&mut self) {
        let now = now();
        let (expired, renewed) = {
            let mut awareness = self.awareness.write();
            (awareness.expire(now), awareness.renew_local(now))
        };
        if !expired.is_empty() {
            debug!(count = expired.len(), "awareness entries expired");
            self.emit(SyncEvent::AwarenessChanged(AwarenessChange {
                removed: expired,
                ..Default::default()
            }));
        }
        if let Some(update) = renewed {
            self.broadcast(&PeerMessage::Awareness(vec![update]), None);
        }
    }

    fn peer_left(&mut self, peer: PeerId) {
        info!(%peer, "peer left");
        if let Some(membership) = &self.membership {
            membership.release(peer);
        }
        self.emit(SyncEvent::PeerLeft(peer));
    }

    fn send_to(&mut self, peer: PeerId, message: &PeerMessage) {
        let frame = match encode_message(message) {
            Ok(bytes) => Arc::new(bytes),
            Err(err) => {
                error!(error = %err, kind = message.kind(), "failed to encode message");
                return;
            }
        };
        match self.mesh.send(peer, frame) {
            Ok(()) => {}
            Err(ChannelError::NotOpen(_)) => debug!(%peer, "dropping message for closed channel"),
            Err(err) => {
                warn!(%peer, error = %err, "send failed");
                self.peer_left(peer);
            }
        }
    }

    fn broadcast(&mut self, message: &PeerMessage, except: Option<PeerId>) {
        if self.mesh.is_empty() {
            return;
        }
        let frame = match encode_message(message) {
            Ok(bytes) => Arc::new(bytes),
            Err(err) => {
                error!(error = %err, kind = message.kind(), "failed to encode message");
                return;
            }
        };
        for peer in self.mesh.broadcast(frame, except) {
            self.peer_left(peer);
        }
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

async fn next_signaling_event(membership: &mut Option<RoomMembership>) -> Option<SignalingEvent> {
    match membership {
        Some(membership) => membership.next_event().await,
        None => std::future::pending().await,
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
