//! Rendezvous server for peer-sync rooms.
//!
//! Peers connect to `/ws`, join rooms and exchange connection offers through
//! it; document data flows directly between peers afterwards.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use peer_sync::RendezvousConfig;
use peer_sync::server::{AppState, serve};

#[derive(Parser, Debug)]
#[command(name = "peer-sync-rendezvous", version, about)]
struct Args {
    /// Address to listen on, overrides the config file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// TOML config file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RendezvousConfig::load(path)?,
        None => RendezvousConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }

    info!("Starting peer-sync rendezvous...");
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    let addr = listener.local_addr()?;

    info!("Server listening on http://{}", addr);
    info!("Available endpoints:");
    info!("  GET /health - Health check");
    info!("  GET /ws     - Signaling websocket");

    serve(listener, AppState::new(&config)).await?;
    Ok(())
}
