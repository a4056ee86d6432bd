//! End-to-end tests: orchestrators meeting through a real rendezvous server
//! and syncing over direct TCP channels.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_sync::codec::decode_message;
use peer_sync::config::SignalingConfig;
use peer_sync::mesh::PeerStream;
use peer_sync::server::{AppState, serve};
use peer_sync::signaling::{ConnectError, PendingAnswer, PendingOffer};
use peer_sync::{
    Connector, LocalEdit, PeerId, PeerMessage, RendezvousConfig, Replica, SyncConfig, SyncError,
    SyncEvent, SyncHandle, SyncOrchestrator, TcpConnector, UserPresence,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// A rendezvous server on its own runtime, so stopping it also drops every
/// open signaling connection.
struct Rendezvous {
    addr: SocketAddr,
    stop: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Rendezvous {
    fn start() -> Self {
        Self::start_with(RendezvousConfig::default())
    }

    fn start_with(config: RendezvousConfig) -> Self {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                let state = AppState::new(&config);
                tokio::select! {
                    _ = serve(listener, state) => {}
                    _ = stopped => {}
                }
            });
        });
        let addr = addr_rx.recv().unwrap();
        Self {
            addr,
            stop: Some(stop),
            thread: Some(thread),
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        self.stop();
    }
}

fn config(url: String) -> SyncConfig {
    SyncConfig {
        signaling_url: url,
        signaling: SignalingConfig {
            max_attempts: 3,
            base_delay_ms: 20,
            max_delay_ms: 100,
            ..SignalingConfig::default()
        },
        ..SyncConfig::default()
    }
}

fn spawn(url: String, replica_id: u64) -> SyncHandle {
    spawn_via(url, replica_id, PeerId::random(), Arc::new(TcpConnector::default()))
}

fn spawn_via(url: String, replica_id: u64, peer_id: PeerId, connector: Arc<dyn Connector>) -> SyncHandle {
    SyncOrchestrator::spawn_with(config(url), connector, Replica::new(replica_id), peer_id)
}

type Tap = Arc<Mutex<Vec<u8>>>;

/// TCP connections except to `blocked`, recording every byte read from the
/// channels it opens.
struct FilteredConnector {
    inner: TcpConnector,
    blocked: PeerId,
    tap: Tap,
}

#[async_trait]
impl Connector for FilteredConnector {
    async fn offer(&self, remote: PeerId) -> Result<Box<dyn PendingOffer>, ConnectError> {
        if remote == self.blocked {
            return Err(ConnectError::Handshake);
        }
        let inner = self.inner.offer(remote).await?;
        Ok(Box::new(TappedOffer {
            inner,
            tap: Arc::clone(&self.tap),
        }))
    }

    async fn answer(&self, remote: PeerId, offer_sdp: &str) -> Result<Box<dyn PendingAnswer>, ConnectError> {
        if remote == self.blocked {
            return Err(ConnectError::Handshake);
        }
        let inner = self.inner.answer(remote, offer_sdp).await?;
        Ok(Box::new(TappedAnswer {
            inner,
            tap: Arc::clone(&self.tap),
        }))
    }
}

struct TappedOffer {
    inner: Box<dyn PendingOffer>,
    tap: Tap,
}

#[async_trait]
impl PendingOffer for TappedOffer {
    fn sdp(&self) -> String {
        self.inner.sdp()
    }

    async fn complete(self: Box<Self>, answer_sdp: &str) -> Result<PeerStream, ConnectError> {
        let stream = self.inner.complete(answer_sdp).await?;
        Ok(Box::new(Tapped { stream, tap: self.tap }))
    }
}

struct TappedAnswer {
    inner: Box<dyn PendingAnswer>,
    tap: Tap,
}

#[async_trait]
impl PendingAnswer for TappedAnswer {
    fn sdp(&self) -> String {
        self.inner.sdp()
    }

    async fn connected(self: Box<Self>) -> Result<PeerStream, ConnectError> {
        let stream = self.inner.connected().await?;
        Ok(Box::new(Tapped { stream, tap: self.tap }))
    }
}

struct Tapped {
    stream: PeerStream,
    tap: Tap,
}

impl AsyncRead for Tapped {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            self.tap.lock().extend_from_slice(&buf.filled()[before..]);
        }
        result
    }
}

impl AsyncWrite for Tapped {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Splits recorded channel bytes into decoded peer messages.
fn tapped_messages(tap: &Tap) -> Vec<PeerMessage> {
    let bytes = tap.lock().clone();
    let mut messages = Vec::new();
    let mut rest = bytes.as_slice();
    while rest.len() >= 4 {
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            break;
        }
        messages.push(decode_message(&rest[4..4 + len]).unwrap());
        rest = &rest[4 + len..];
    }
    messages
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn expect_event(
    events: &mut broadcast::Receiver<SyncEvent>,
    what: &str,
    matches: impl Fn(&SyncEvent) -> bool,
) -> SyncEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) if matches(&event) => return event,
            Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
            Ok(Err(broadcast::error::RecvError::Closed)) => panic!("event stream closed waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_world_merge_over_rendezvous() {
    let rendezvous = Rendezvous::start();
    let a = spawn(rendezvous.url(), 1);
    let b = spawn(rendezvous.url(), 2);
    let mut a_events = a.subscribe();

    // Both edit while offline
    a.apply_local(LocalEdit::insert(0, "hello")).await.unwrap();
    b.apply_local(LocalEdit::insert(0, "world")).await.unwrap();

    a.connect("doc").await.unwrap();
    b.connect("doc").await.unwrap();
    expect_event(&mut a_events, "room connected", |e| matches!(e, SyncEvent::RoomConnected { .. })).await;
    let b_peer = b.peer_id();
    expect_event(&mut a_events, "peer joined", |e| *e == SyncEvent::PeerJoined(b_peer)).await;

    eventually("convergence", || a.text().len() == 10 && a.text() == b.text()).await;
    // Concurrent runs at the document start: the higher replica id goes first
    assert_eq!(a.text(), "worldhello");
    assert_eq!(a.state_vector(), b.state_vector());

    // Steady state: incremental updates flow both ways
    a.apply_local(LocalEdit::insert(10, "!")).await.unwrap();
    b.apply_local(LocalEdit::format(0, 5, "bold", "true")).await.unwrap();
    eventually("incremental sync", || a.snapshot() == b.snapshot() && a.text() == "worldhello!").await;
    assert_eq!(a.snapshot().spans[0].text, "world");

    // Connecting to the current room again is a no-op
    a.connect("doc").await.unwrap();
    assert_eq!(a.connected_peers().await.unwrap(), vec![b_peer]);

    b.disconnect().await.unwrap();
    expect_event(&mut a_events, "peer left", |e| *e == SyncEvent::PeerLeft(b_peer)).await;
    b.disconnect().await.unwrap();

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_awareness_propagates_and_leaves() {
    let rendezvous = Rendezvous::start();
    let a = spawn(rendezvous.url(), 1);
    let b = spawn(rendezvous.url(), 2);

    a.set_awareness(UserPresence::new("ada", "#ff0000").to_state()).await.unwrap();
    a.connect("presence").await.unwrap();
    b.connect("presence").await.unwrap();

    let a_peer = a.peer_id();
    eventually("remote presence", || b.awareness_snapshot().contains_key(&a_peer)).await;
    let state = b.awareness_snapshot()[&a_peer].clone();
    assert_eq!(UserPresence::from_state(&state).unwrap().name, "ada");

    a.set_awareness(UserPresence::new("ada lovelace", "#ff0000").to_state()).await.unwrap();
    eventually("presence update", || {
        b.awareness_snapshot()
            .get(&a_peer)
            .and_then(UserPresence::from_state)
            .is_some_and(|p| p.name == "ada lovelace")
    })
    .await;

    // An explicit leave removes the entry without waiting for expiry
    a.disconnect().await.unwrap();
    eventually("presence removal", || !b.awareness_snapshot().contains_key(&a_peer)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_peers_converge() {
    let rendezvous = Rendezvous::start();
    let peers: Vec<SyncHandle> = (1..=3).map(|id| spawn(rendezvous.url(), id)).collect();

    for (i, peer) in peers.iter().enumerate() {
        peer.apply_local(LocalEdit::insert(0, format!("<{i}>"))).await.unwrap();
        peer.connect("trio").await.unwrap();
    }
    eventually("three-way convergence", || {
        let text = peers[0].text();
        text.len() == 9 && peers.iter().all(|p| p.text() == text)
    })
    .await;

    peers[1].apply_local(LocalEdit::delete(0, 3)).await.unwrap();
    eventually("delete propagation", || peers.iter().all(|p| p.text().len() == 6)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_signaling_loss_keeps_existing_channels() {
    let mut rendezvous = Rendezvous::start();
    let a = spawn(rendezvous.url(), 1);
    let b = spawn(rendezvous.url(), 2);
    let mut a_events = a.subscribe();

    a.connect("doc").await.unwrap();
    b.connect("doc").await.unwrap();
    let b_peer = b.peer_id();
    expect_event(&mut a_events, "peer joined", |e| *e == SyncEvent::PeerJoined(b_peer)).await;

    rendezvous.stop();
    expect_event(&mut a_events, "connect failure", |e| {
        matches!(e, SyncEvent::RoomConnectFailed { room, .. } if room == "doc")
    })
    .await;

    // The direct channel outlives the rendezvous
    a.apply_local(LocalEdit::insert(0, "still here")).await.unwrap();
    eventually("sync without rendezvous", || b.text() == "still here").await;
    assert_eq!(a.connected_peers().await.unwrap(), vec![b_peer]);
}

#[tokio::test]
async fn test_unreachable_rendezvous_reports_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let handle = spawn(format!("ws://{addr}/ws"), 1);
    let mut events = handle.subscribe();

    assert!(matches!(handle.connect("").await, Err(SyncError::EmptyRoom)));
    handle.connect("nowhere").await.unwrap();
    expect_event(&mut events, "connect failure", |e| {
        matches!(e, SyncEvent::RoomConnectFailed { reason, .. } if reason.contains("3 attempts"))
    })
    .await;

    // Editing keeps working offline
    handle.apply_local(LocalEdit::insert(0, "offline")).await.unwrap();
    assert_eq!(handle.text(), "offline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_room_reports_connect_failure() {
    let rendezvous = Rendezvous::start_with(RendezvousConfig {
        max_room_size: 1,
        ..RendezvousConfig::default()
    });
    let a = spawn(rendezvous.url(), 1);
    let b = spawn(rendezvous.url(), 2);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.connect("doc").await.unwrap();
    expect_event(&mut a_events, "room connected", |e| matches!(e, SyncEvent::RoomConnected { .. })).await;

    b.connect("doc").await.unwrap();
    let event = expect_event(&mut b_events, "join outcome", |e| {
        matches!(e, SyncEvent::RoomConnected { .. } | SyncEvent::RoomConnectFailed { .. })
    })
    .await;
    match event {
        SyncEvent::RoomConnectFailed { room, reason } => {
            assert_eq!(room, "doc");
            assert!(reason.contains("full"), "{reason}");
        }
        other => panic!("join into a full room was reported as {other:?}"),
    }

    // Another room still works
    b.connect("spare").await.unwrap();
    let event = expect_event(&mut b_events, "second join", |e| {
        matches!(e, SyncEvent::RoomConnected { .. } | SyncEvent::RoomConnectFailed { .. })
    })
    .await;
    assert_eq!(event, SyncEvent::RoomConnected { room: "spare".into() });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_middle_peer_relays_without_echo() {
    let rendezvous = Rendezvous::start();
    let (a_peer, b_peer, c_peer) = (PeerId::random(), PeerId::random(), PeerId::random());
    let a_tap = Tap::default();

    // a and c refuse each other, so everything between them goes through b
    let a = spawn_via(
        rendezvous.url(),
        1,
        a_peer,
        Arc::new(FilteredConnector {
            inner: TcpConnector::default(),
            blocked: c_peer,
            tap: Arc::clone(&a_tap),
        }),
    );
    let b = spawn_via(rendezvous.url(), 2, b_peer, Arc::new(TcpConnector::default()));
    let c = spawn_via(
        rendezvous.url(),
        3,
        c_peer,
        Arc::new(FilteredConnector {
            inner: TcpConnector::default(),
            blocked: a_peer,
            tap: Tap::default(),
        }),
    );
    let mut b_events = b.subscribe();

    a.set_awareness(UserPresence::new("ada", "#ff0000").to_state()).await.unwrap();
    for handle in [&a, &b, &c] {
        handle.connect("line").await.unwrap();
    }
    let mut joined = HashSet::new();
    while joined.len() < 2 {
        if let SyncEvent::PeerJoined(peer) =
            expect_event(&mut b_events, "b's channels", |e| matches!(e, SyncEvent::PeerJoined(_))).await
        {
            joined.insert(peer);
        }
    }
    assert_eq!(joined, HashSet::from([a_peer, c_peer]));

    a.apply_local(LocalEdit::insert(0, "abc")).await.unwrap();
    eventually("relay to c", || c.text() == "abc").await;
    c.apply_local(LocalEdit::insert(3, "xyz")).await.unwrap();
    eventually("relay to a", || a.text() == "abcxyz").await;
    eventually("presence relayed to c", || c.awareness_snapshot().contains_key(&a_peer)).await;

    assert_eq!(a.connected_peers().await.unwrap(), vec![b_peer]);
    assert_eq!(c.connected_peers().await.unwrap(), vec![b_peer]);

    // Give a stray echo time to arrive before inspecting a's inbound traffic
    tokio::time::sleep(Duration::from_millis(200)).await;
    let received: Vec<_> = tapped_messages(&a_tap)
        .into_iter()
        .filter_map(|message| match message {
            PeerMessage::Update(update) | PeerMessage::SyncStep2(update) => Some(update),
            _ => None,
        })
        .flat_map(|update| update.operations)
        .collect();
    assert!(received.iter().any(|op| op.id.replica == 3), "c's edit never reached a");
    assert!(
        received.iter().all(|op| op.id.replica != 1),
        "b sent a's own operations back"
    );
}
