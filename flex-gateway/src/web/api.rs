//! Control API endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use log::info;
use serde::Deserialize;
use serde_json::json;

use crate::server::{CommandError, DeviceInfo};
use crate::web::state::WebState;

/// Body of a command request.
#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// Get all connected devices.
pub async fn get_devices(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let mut devices: Vec<DeviceInfo> = web_state
        .registry
        .get_all()
        .await
        .iter()
        .map(|s| s.info())
        .collect();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));

    let count = devices.len();
    Json(json!({
        "success": true,
        "devices": devices,
        "count": count
    }))
}

/// Get one connected device.
pub async fn get_device(
    State(web_state): State<Arc<WebState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match web_state.registry.lookup(&id).await {
        Some(session) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "device": session.info()
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": format!("Device {} is not connected", id)
            })),
        ),
    }
}

/// Queue an NTCB command for a device.
pub async fn send_command(
    State(web_state): State<Arc<WebState>>,
    Path(id): Path<String>,
    Json(payload): Json<CommandRequest>,
) -> impl IntoResponse {
    match web_state.registry.send_command(&id, &payload.command).await {
        Ok(()) => {
            web_state.metrics.record_command();
            info!("Command for {} queued: {}", id, payload.command);
            (StatusCode::OK, Json(json!({ "success": true })))
        }
        Err(e) => {
            let status = match &e {
                CommandError::DeviceNotConnected(_) => StatusCode::NOT_FOUND,
                CommandError::InvalidCommand(_) => StatusCode::BAD_REQUEST,
                CommandError::ConnectionClosed(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (
                status,
                Json(json!({
                    "success": false,
                    "error": e.to_string()
                })),
            )
        }
    }
}

/// Close a device's connection.
pub async fn disconnect_device(
    State(web_state): State<Arc<WebState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if web_state.registry.request_shutdown(&id).await {
        info!("Disconnect requested for {}", id);
        (StatusCode::OK, Json(json!({ "success": true })))
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": format!("Device {} is not connected", id)
            })),
        )
    }
}

/// Get gateway counters.
pub async fn get_stats(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let stats = web_state.metrics.snapshot();
    let devices = web_state.registry.count().await;
    Json(json!({
        "success": true,
        "devices": devices,
        "stats": stats
    }))
}
