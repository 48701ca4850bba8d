//! Operator control API.

pub mod api;
pub mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::WebState;

/// Build the control API router.
pub fn router(state: Arc<WebState>) -> Router {
    Router::new()
        .route("/api/devices", get(api::get_devices))
        .route("/api/devices/:id", get(api::get_device))
        .route("/api/devices/:id/command", post(api::send_command))
        .route("/api/devices/:id/disconnect", post(api::disconnect_device))
        .route("/api/stats", get(api::get_stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the control API until `shutdown` is cancelled.
pub async fn start_web_server(
    listen_addr: SocketAddr,
    state: Arc<WebState>,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    log::info!("Control API listening on http://{}", listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
