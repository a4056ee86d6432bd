//! HTTP surface of the rendezvous server.

use axum::{
    Router,
    extract::{State, ws::WebSocketUpgrade},
    response::{Json, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RendezvousConfig;
use crate::server::rooms::Rooms;
use crate::server::session::RendezvousSession;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub rooms: usize,
    pub peers: usize,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub rooms: Rooms,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: &RendezvousConfig) -> Self {
        Self {
            rooms: Rooms::new(config.max_room_size),
            started_at: Utc::now(),
        }
    }
}

/// Liveness and occupancy
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        rooms: state.rooms.room_count().await,
        peers: state.rooms.peer_count().await,
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Upgrades to a signaling websocket
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| RendezvousSession::new(socket, state.rooms).handle())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state)
}
