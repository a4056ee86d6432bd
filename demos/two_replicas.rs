//! Two collaborators editing the same document over a local rendezvous.
//!
//! Starts a rendezvous server in-process, spawns two sync engines that edit
//! while offline, connects them to one room and prints the merged result.
//!
//! Run with: cargo run --example two_replicas

use std::sync::Arc;
use std::time::Duration;

use peer_sync::server::{AppState, serve};
use peer_sync::{
    LocalEdit, PeerId, RendezvousConfig, Replica, SyncConfig, SyncEvent, SyncOrchestrator,
    TcpConnector, UserPresence,
};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("peer_sync=info").init();

    println!("=== Two replicas over a local rendezvous ===\n");

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/ws", listener.local_addr()?);
    tokio::spawn(serve(listener, AppState::new(&RendezvousConfig::default())));

    let config = SyncConfig {
        signaling_url: url,
        ..SyncConfig::default()
    };
    let connector = Arc::new(TcpConnector::default());
    let alice = SyncOrchestrator::spawn_with(config.clone(), connector.clone(), Replica::new(1), PeerId::random());
    let bob = SyncOrchestrator::spawn_with(config, connector, Replica::new(2), PeerId::random());

    alice.set_awareness(UserPresence::new("Alice", "#e91e63").to_state()).await?;
    bob.set_awareness(UserPresence::new("Bob", "#3f51b5").to_state()).await?;

    // Both type while offline
    alice.apply_local(LocalEdit::insert(0, "Hello")).await?;
    bob.apply_local(LocalEdit::insert(0, "World!")).await?;
    println!("--- Before Synchronization ---");
    println!("  Alice sees: '{}'", alice.text());
    println!("  Bob sees:   '{}'", bob.text());

    let mut events = alice.subscribe();
    alice.connect("demo").await?;
    bob.connect("demo").await?;

    println!("\n--- Synchronizing Changes ---");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while alice.text() != bob.text() || alice.text().len() < 11 {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(SyncEvent::PeerJoined(peer))) => println!("  Alice connected to {peer}"),
            Ok(Ok(_)) => {}
            Ok(Err(_)) | Err(_) => break,
        }
    }

    println!("\n--- After Synchronization ---");
    println!("  Alice sees: '{}'", alice.text());
    println!("  Bob sees:   '{}'", bob.text());
    println!("  Converged:  {}", alice.text() == bob.text());

    println!("\n--- Presence seen by Alice ---");
    for (peer, state) in alice.awareness_snapshot() {
        if let Some(presence) = UserPresence::from_state(&state) {
            println!("  {peer}: {} ({})", presence.name, presence.color);
        }
    }

    alice.shutdown().await?;
    bob.shutdown().await?;
    Ok(())
}
