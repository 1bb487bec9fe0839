//! /status, /cache/gc, /daemon/shutdown handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use super::{transfer_error, ApiError, ApiState};

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub peer_id: String,
    pub uptime_secs: u64,
    pub links: usize,
    pub connected: usize,
    pub pending_messages: usize,
    pub local_files: usize,
    pub active_transfers: usize,
    pub cache: CacheInfo,
}

#[derive(Serialize)]
pub struct CacheInfo {
    pub chunks: usize,
    pub bytes: u64,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let node = &state.node;
    let store = node.engine.store();
    Json(StatusResponse {
        peer_id: node.id.to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        links: node.links.snapshot().len(),
        connected: node.links.connected_peers().len(),
        pending_messages: node.router.pending_total(),
        local_files: node.engine.local_files().len(),
        active_transfers: node.engine.active_transfers().len(),
        cache: CacheInfo {
            chunks: store.count(),
            bytes: store.size(),
        },
    })
}

// ── /cache/gc ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct GcResponse {
    pub removed: usize,
    pub remaining: usize,
}

pub async fn handle_cache_gc(State(state): State<ApiState>) -> Result<Json<GcResponse>, ApiError> {
    let engine = &state.node.engine;
    let removed = engine.collect_garbage().map_err(transfer_error)?;
    tracing::info!(removed, "chunk store collected via API");
    Ok(Json(GcResponse {
        removed,
        remaining: engine.store().count(),
    }))
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(
    State(state): State<ApiState>,
) -> Result<Json<ShutdownResponse>, ApiError> {
    tracing::info!("shutdown requested via API");
    state.shutdown_tx.send(()).map_err(|_| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "daemon is already shutting down".to_string(),
        )
    })?;
    Ok(Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    }))
}
