use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::mesh::channel::{ChannelError, ChannelState, PeerChannel};
use crate::peer::PeerId;

/// Frame payloads are shared between the outbound queues of all peers.
pub type Frame = Arc<Vec<u8>>;

/// Produced by the per-peer reader and writer tasks.
#[derive(Debug)]
pub enum MeshEvent {
    Frame {
        peer: PeerId,
        bytes: Vec<u8>,
    },
    /// The transport ended. `error` is `None` for a clean close.
    Closed {
        peer: PeerId,
        generation: u64,
        error: Option<ChannelError>,
    },
}

struct PeerLink {
    state: ChannelState,
    generation: u64,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    decode_failures: u32,
}

impl PeerLink {
    fn abort(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// The set of open channels to the other members of a room.
///
/// Owned by a single event loop; inbound frames and channel closures are
/// reported on the receiver returned by [`PeerMesh::new`].
pub struct PeerMesh {
    config: MeshConfig,
    links: HashMap<PeerId, PeerLink>,
    events: mpsc::Sender<MeshEvent>,
    next_generation: u64,
}

impl PeerMesh {
    pub fn new(config: MeshConfig) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (events, receiver) = mpsc::channel(config.event_capacity.max(1));
        let mesh = Self {
            config,
            links: HashMap::new(),
            events,
            next_generation: 0,
        };
        (mesh, receiver)
    }

    /// Takes ownership of a negotiated channel and opens it. A channel already
    /// attached for the same peer is replaced.
    pub fn attach(&mut self, channel: PeerChannel) -> PeerId {
        let peer = channel.peer();
        if let Some(old) = self.links.remove(&peer) {
            debug!(%peer, "replacing existing channel");
            old.abort();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let mut state = ChannelState::Connecting;

        let (mut reader, mut writer) = channel.into_split(self.config.max_frame_len);
        let (outbound, mut queue) = mpsc::channel::<Frame>(self.config.outbound_capacity.max(1));

        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let error = loop {
                match reader.read_frame().await {
                    Ok(Some(bytes)) => {
                        if events.send(MeshEvent::Frame { peer, bytes }).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break None,
                    Err(err) => break Some(err),
                }
            };
            let _ = events
                .send(MeshEvent::Closed {
                    peer,
                    generation,
                    error,
                })
                .await;
        });

        let events = self.events.clone();
        let writer = tokio::spawn(async move {
            while let Some(frame) = queue.recv().await {
                if let Err(err) = writer.write_frame(&frame).await {
                    let _ = events
                        .send(MeshEvent::Closed {
                            peer,
                            generation,
                            error: Some(err),
                        })
                        .await;
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });

        if let Err(err) = state.transition(ChannelState::Open) {
            warn!(%peer, error = %err, "channel did not open");
        }
        info!(%peer, generation, "peer channel open");
        self.links.insert(
            peer,
            PeerLink {
                state,
                generation,
                outbound,
                reader,
                writer,
                decode_failures: 0,
            },
        );
        peer
    }

    /// Queues one frame for `peer`. A full queue fails the channel; any error
    /// other than `NotOpen` means the channel was failed by this call.
    pub fn send(&mut self, peer: PeerId, frame: Frame) -> Result<(), ChannelError> {
        let link = self
            .links
            .get(&peer)
            .filter(|link| link.state == ChannelState::Open)
            .ok_or(ChannelError::NotOpen(peer))?;

        match link.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.fail(peer, "outbound queue full");
                Err(ChannelError::Backpressure(peer))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.fail(peer, "writer stopped");
                Err(ChannelError::Failed {
                    peer,
                    reason: "writer stopped".into(),
                })
            }
        }
    }

    /// Queues `frame` for every open peer except `except`. Returns the peers
    /// whose channels failed while doing so.
    pub fn broadcast(&mut self, frame: Frame, except: Option<PeerId>) -> Vec<PeerId> {
        let targets: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(peer, link)| link.state == ChannelState::Open && Some(**peer) != except)
            .map(|(peer, _)| *peer)
            .collect();

        targets
            .into_iter()
            .filter(|peer| self.send(*peer, frame.clone()).is_err())
            .collect()
    }

    /// Handles a `Closed` event. Returns true when it ended the current
    /// channel to `peer` rather than one already replaced.
    pub fn on_closed(&mut self, peer: PeerId, generation: u64, error: Option<&ChannelError>) -> bool {
        match self.links.get(&peer) {
            Some(link) if link.generation == generation => {}
            _ => return false,
        }
        match error {
            Some(err) => self.fail(peer, &err.to_string()),
            None => self.close(peer),
        };
        true
    }

    /// Counts an undecodable frame. Returns true when this failed the channel.
    pub fn record_decode_failure(&mut self, peer: PeerId) -> bool {
        let Some(link) = self.links.get_mut(&peer) else {
            return false;
        };
        link.decode_failures += 1;
        if link.decode_failures >= self.config.max_decode_failures.max(1) {
            self.fail(peer, "too many undecodable frames");
            return true;
        }
        false
    }

    pub fn record_decode_success(&mut self, peer: PeerId) {
        if let Some(link) = self.links.get_mut(&peer) {
            link.decode_failures = 0;
        }
    }

    /// Closes the channel to `peer` immediately.
    pub fn close(&mut self, peer: PeerId) -> bool {
        let Some(mut link) = self.links.remove(&peer) else {
            return false;
        };
        let _ = link.state.transition(ChannelState::Closing);
        link.abort();
        let _ = link.state.transition(ChannelState::Closed);
        debug!(%peer, "peer channel closed");
        true
    }

    pub fn fail(&mut self, peer: PeerId, reason: &str) -> bool {
        let Some(mut link) = self.links.remove(&peer) else {
            return false;
        };
        let _ = link.state.transition(ChannelState::Failed);
        link.abort();
        warn!(%peer, reason, "peer channel failed");
        true
    }

    /// Closes every channel, letting writers flush queued frames for up to
    /// `grace`. Returns the peers that were attached.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<PeerId> {
        let deadline = tokio::time::Instant::now() + grace;
        let mut closed = Vec::with_capacity(self.links.len());
        let mut writers = Vec::with_capacity(self.links.len());

        for (peer, mut link) in self.links.drain() {
            let _ = link.state.transition(ChannelState::Closing);
            link.reader.abort();
            drop(link.outbound);
            writers.push(link.writer);
            closed.push(peer);
        }
        for mut writer in writers {
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        closed
    }

    pub fn state(&self, peer: PeerId) -> Option<ChannelState> {
        self.links.get(&peer).map(|link| link.state)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, link)| link.state == ChannelState::Open)
            .map(|(peer, _)| *peer)
            .collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl Drop for PeerMesh {
    fn drop(&mut self) {
        for link in self.links.values() {
            link.abort();
        }
    }
}
