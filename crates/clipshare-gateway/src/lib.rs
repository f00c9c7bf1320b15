pub mod connection;
pub mod hub;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;

use crate::hub::Hub;

/// Largest WebSocket frame accepted from a client.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Routes served by the gateway: the hub socket and a health probe.
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/hub", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(hub)
}

async fn ws_upgrade(State(hub): State<Hub>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| connection::handle_connection(socket, hub))
}

async fn health(State(hub): State<Hub>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": hub.connection_count().await,
        "active_rooms": hub.active_room_count().await,
    }))
}
