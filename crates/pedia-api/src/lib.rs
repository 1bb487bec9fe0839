pub mod handlers;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/peers", get(handlers::handle_peers))
        .route("/peers/{id}/connect", post(handlers::handle_peer_connect))
        .route("/peers/{id}", delete(handlers::handle_peer_disconnect))
        .route(
            "/files",
            get(handlers::handle_files)
                .post(handlers::handle_share)
                .layer(DefaultBodyLimit::max(handlers::files::MAX_UPLOAD_BYTES)),
        )
        .route("/files/{id}/download", post(handlers::handle_download))
        .route("/files/{id}/pause", post(handlers::handle_pause))
        .route("/files/{id}/resume", post(handlers::handle_resume))
        .route("/files/{id}", delete(handlers::handle_cancel))
        .route("/transfers", get(handlers::handle_transfers))
        .route(
            "/topics/{id}/members",
            get(handlers::handle_topic_members).post(handlers::handle_topic_update),
        )
        .route("/cache/gc", post(handlers::handle_cache_gc))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

/// Serve the control API on localhost until the shutdown broadcast fires.
pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown_tx.subscribe();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
