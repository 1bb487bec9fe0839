//! /files, /transfers handlers: sharing and downloading.

use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use pedia_core::{FileId, TopicId};
use pedia_services::{DownloadOptions, Priority, ShareOptions, TransferError, TransferSummary};

use super::{non_empty, transfer_error, ApiError, ApiState};

/// Maximum upload size per file (256 MB).
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

// ── /files (GET) ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct FilesResponse {
    pub files: Vec<FileInfo>,
}

#[derive(Serialize)]
pub struct FileInfo {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub chunks: usize,
    pub sharer: String,
    pub topic_id: String,
    pub local: bool,
    pub holders: Vec<String>,
    pub transfer: Option<TransferSummary>,
}

pub async fn handle_files(State(state): State<ApiState>) -> Result<Json<FilesResponse>, ApiError> {
    let engine = &state.node.engine;
    let local = engine.local_files();
    let mut manifests = engine
        .manifests()
        .list_manifests()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    manifests.sort_by(|a, b| b.created.cmp(&a.created));

    let files = manifests
        .into_iter()
        .map(|m| FileInfo {
            local: local.contains(&m.file_id),
            holders: engine.holders(&m.file_id).iter().map(|p| p.to_string()).collect(),
            transfer: engine.transfer_progress(&m.file_id),
            chunks: m.chunk_count(),
            sharer: m.sharer.to_string(),
            topic_id: m.topic_id.to_string(),
            file_id: m.file_id,
            name: m.name,
            size: m.size,
            mime_type: m.mime_type,
        })
        .collect();
    Ok(Json(FilesResponse { files }))
}

// ── /files (POST) ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShareResponse {
    pub file_id: FileId,
    pub name: String,
    pub bytes: u64,
    pub chunks: usize,
}

/// Multipart fields: `topic` (text) and one file part.
pub async fn handle_share(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<Json<ShareResponse>, ApiError> {
    let mut file_data = Vec::new();
    let mut filename = String::from("uploaded_file");
    let mut mime_type = None;
    let mut topic = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        if field_name == "topic" {
            let text = field
                .text()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            topic = Some(TopicId::from(text.trim()));
        } else {
            if let Some(name) = field.file_name() {
                filename = sanitize_filename(name);
            }
            mime_type = field.content_type().map(|m| m.to_string());
            let data = field
                .bytes()
                .await
                .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
            if file_data.len() + data.len() > MAX_UPLOAD_BYTES {
                return Err((
                    StatusCode::PAYLOAD_TOO_LARGE,
                    format!("file exceeds {} byte limit", MAX_UPLOAD_BYTES),
                ));
            }
            file_data.extend_from_slice(&data);
        }
    }

    let topic = topic.ok_or((StatusCode::BAD_REQUEST, "missing topic field".to_string()))?;
    non_empty("topic", topic.as_str())?;
    if file_data.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "no file data".to_string()));
    }

    // Browsers send octet-stream for anything unknown; let the name decide.
    let mime_type = mime_type.filter(|m| m != "application/octet-stream");
    // Chunking hashes and writes every piece; keep it off the runtime.
    let engine = state.node.engine.clone();
    let bytes = file_data.len() as u64;
    let name = filename.clone();
    let (file_id, chunks) = tokio::task::spawn_blocking(move || {
        let file_id = engine.share_file(&file_data, &topic, ShareOptions { name, mime_type })?;
        let chunks = engine
            .manifests()
            .get_manifest(&file_id)
            .ok()
            .flatten()
            .map(|m| m.chunk_count())
            .unwrap_or(0);
        Ok::<_, TransferError>((file_id, chunks))
    })
    .await
    .unwrap_or_else(|e| Err(TransferError::from(e)))
    .map_err(transfer_error)?;

    tracing::info!(file = %file_id, filename, bytes, "file shared via API");
    Ok(Json(ShareResponse {
        file_id,
        name: filename,
        bytes,
        chunks,
    }))
}

/// Sanitize a filename: strip path components, reject traversal attempts.
fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    let trimmed = base.trim_start_matches('.');
    let clean: String = trimmed
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if clean.is_empty() {
        "uploaded_file".to_string()
    } else {
        clean
    }
}

// ── /files/{id}/download ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct DownloadRequest {
    pub destination: Option<PathBuf>,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub file_id: FileId,
    pub started: bool,
}

/// Starts the download in the background; progress is visible on
/// `/transfers` and the outcome in the event stream and logs.
pub async fn handle_download(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<DownloadResponse>), ApiError> {
    non_empty("file id", &file_id)?;
    let file_id = FileId::from(file_id.as_str());
    // The body is optional.
    let request: DownloadRequest = if body.iter().all(u8::is_ascii_whitespace) {
        DownloadRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid download request: {e}")))?
    };
    let engine = state.node.engine.clone();

    let known = engine
        .manifests()
        .get_manifest(&file_id)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .is_some();
    if !known {
        return Err((StatusCode::NOT_FOUND, format!("manifest not found: {file_id}")));
    }
    if engine.transfer_progress(&file_id).is_some() {
        return Err((StatusCode::CONFLICT, format!("a transfer of {file_id} is already active")));
    }

    let options = DownloadOptions {
        destination: request.destination,
        priority: request.priority,
    };
    let id = file_id.clone();
    tokio::spawn(async move {
        match engine.download_file(&id, options).await {
            Ok(path) => tracing::info!(file = %id, path = %path.display(), "download finished"),
            Err(e) => tracing::warn!(file = %id, error = %e, "download ended"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(DownloadResponse {
            file_id,
            started: true,
        }),
    ))
}

// ── /files/{id}/pause, /resume, DELETE ────────────────────────────────────────

#[derive(Serialize)]
pub struct ControlResponse {
    pub file_id: FileId,
    pub action: &'static str,
}

pub async fn handle_pause(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let file_id = FileId::from(file_id.as_str());
    state.node.engine.pause(&file_id).map_err(transfer_error)?;
    Ok(Json(ControlResponse {
        file_id,
        action: "paused",
    }))
}

pub async fn handle_resume(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let file_id = FileId::from(file_id.as_str());
    state.node.engine.resume(&file_id).map_err(transfer_error)?;
    Ok(Json(ControlResponse {
        file_id,
        action: "resumed",
    }))
}

pub async fn handle_cancel(
    State(state): State<ApiState>,
    Path(file_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let file_id = FileId::from(file_id.as_str());
    state.node.engine.cancel(&file_id).map_err(transfer_error)?;
    Ok(Json(ControlResponse {
        file_id,
        action: "cancelled",
    }))
}

// ── /transfers ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct TransfersResponse {
    pub transfers: Vec<TransferSummary>,
}

pub async fn handle_transfers(State(state): State<ApiState>) -> Json<TransfersResponse> {
    Json(TransfersResponse {
        transfers: state.node.engine.active_transfers(),
    })
}
