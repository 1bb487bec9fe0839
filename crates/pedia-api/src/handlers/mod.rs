//! HTTP API handlers: exposes node state as JSON and drives shares and
//! downloads.

pub mod files;
pub mod peers;
pub mod status;
pub mod topics;

use std::time::Instant;

use axum::http::StatusCode;

use pedia_services::{Node, TransferError};

#[derive(Clone)]
pub struct ApiState {
    pub node: Node,
    pub started: Instant,
    /// Shutdown broadcast sender: signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

fn transfer_error(e: TransferError) -> ApiError {
    let status = match &e {
        TransferError::ManifestNotFound(_) | TransferError::TransferNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        TransferError::TransferActive(_) => StatusCode::CONFLICT,
        TransferError::InvalidManifest { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn non_empty(kind: &str, raw: &str) -> Result<(), ApiError> {
    if raw.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, format!("{kind} must not be empty")));
    }
    Ok(())
}

// Re-export handler functions for use in router setup.
pub use files::{
    handle_cancel, handle_download, handle_files, handle_pause, handle_resume, handle_share,
    handle_transfers,
};
pub use peers::{handle_peer_connect, handle_peer_disconnect, handle_peers};
pub use status::{handle_cache_gc, handle_shutdown, handle_status};
pub use topics::{handle_topic_members, handle_topic_update};
