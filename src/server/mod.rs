//! Rendezvous server: room membership and offer/answer routing over
//! websockets. It never sees document data.

pub mod rooms;
pub mod routes;
pub mod session;

use tokio::net::TcpListener;

pub use rooms::{JoinError, Rooms};
pub use routes::{AppState, HealthResponse, create_router};
pub use session::RendezvousSession;

/// Serves the rendezvous on an already bound listener until the process ends.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, create_router(state)).await
}
