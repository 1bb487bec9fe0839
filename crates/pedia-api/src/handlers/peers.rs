//! /peers handlers: link inspection, connect and disconnect.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use pedia_core::PeerId;
use pedia_services::link::LinkSnapshot;
use pedia_services::LinkError;

use super::{non_empty, ApiError, ApiState};

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerInfo>,
}

#[derive(Serialize)]
pub struct PeerInfo {
    #[serde(flatten)]
    pub link: LinkSnapshot,
    pub score: f64,
    pub pending_messages: usize,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let node = &state.node;
    let peers = node
        .links
        .snapshot()
        .into_iter()
        .map(|link| PeerInfo {
            score: node.engine.scores().score(&link.peer_id),
            pending_messages: node.router.pending(&link.peer_id).len(),
            link,
        })
        .collect();
    Json(PeersResponse { peers })
}

// ── /peers/{id}/connect ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ConnectResponse {
    pub peer_id: String,
    pub state: String,
    pub generation: u64,
}

pub async fn handle_peer_connect(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<Json<ConnectResponse>, ApiError> {
    non_empty("peer id", &peer_id)?;
    let peer = PeerId::from(peer_id.as_str());
    let link = state.node.links.connect(&peer).map_err(|e| match e {
        LinkError::SelfConnect => (StatusCode::BAD_REQUEST, e.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    })?;
    tracing::info!(peer = %peer, "connect requested via API");
    Ok(Json(ConnectResponse {
        peer_id,
        state: format!("{:?}", link.state()).to_lowercase(),
        generation: link.generation(),
    }))
}

// ── /peers/{id} (DELETE) ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub peer_id: String,
    pub disconnected: bool,
}

pub async fn handle_peer_disconnect(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    non_empty("peer id", &peer_id)?;
    let peer = PeerId::from(peer_id.as_str());
    let disconnected = state.node.links.disconnect(&peer);
    if !disconnected {
        return Err((StatusCode::NOT_FOUND, "no link to peer".to_string()));
    }
    state.node.router.clear_pending(&peer);
    Ok(Json(DisconnectResponse {
        peer_id,
        disconnected,
    }))
}
