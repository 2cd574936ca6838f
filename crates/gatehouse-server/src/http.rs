//! HTTP request handlers
//!
//! The approval surface the handshake's `NOT_PAIRED` responses point at:
//! pending pairing requests, paired device management, presence, and server
//! info, next to the WebSocket endpoint itself.

use axum::{
    extract::{Path as AxumPath, State},
    http::{HeaderValue, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use gatehouse_auth::{AuditEntry, PairedDeviceRecord, PairingError, PendingPairingRequest};
use gatehouse_core::protocol::{PresenceEntry, PROTOCOL_VERSION};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);
    Router::new()
        // WebSocket endpoint
        .route("/ws", get(crate::websocket::gateway_ws_handler))
        // Pairing approval API
        .route("/api/pairing/pending", get(pending_handler))
        .route("/api/pairing/:id/approve", post(approve_handler))
        .route("/api/pairing/:id/deny", post(deny_handler))
        // Device management API
        .route("/api/devices", get(list_devices_handler))
        .route("/api/devices/:id", delete(revoke_device_handler))
        // Observability
        .route("/api/presence", get(presence_handler))
        .route("/api/audit", get(audit_handler))
        .route("/api/info", get(server_info_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .control_ui
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if origins.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new().allow_origin(tower_http::cors::AllowOrigin::list(origins))
    }
}

// ============================================================================
// Pairing API Handlers
// ============================================================================

/// List pairing requests awaiting approval
async fn pending_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PendingPairingRequest>> {
    Json(state.pairing.pending().await)
}

/// Approve a pending pairing request
async fn approve_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<PairedDeviceRecord>, (StatusCode, String)> {
    state
        .coordinator
        .approve(&id)
        .await
        .map(Json)
        .map_err(pairing_error_response)
}

/// Deny a pending pairing request
async fn deny_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .coordinator
        .deny(&id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(pairing_error_response)
}

fn pairing_error_response(e: PairingError) -> (StatusCode, String) {
    match e {
        PairingError::RequestNotFound(_) | PairingError::DeviceNotFound(_) => {
            (StatusCode::NOT_FOUND, e.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// Device Management Handlers
// ============================================================================

/// List all paired devices
async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<PairedDeviceRecord>> {
    Json(state.pairing.list().await)
}

/// Unpair a device: removes the trust record and revokes its tokens
async fn revoke_device_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let record = state
        .pairing
        .remove(&id)
        .await
        .map_err(pairing_error_response)?;
    let revoked = state
        .tokens
        .revoke_all(&id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state
        .audit
        .record(AuditEntry {
            device_id: Some(record.device_id.clone()),
            roles_from: Some(record.roles.clone()),
            scopes_from: Some(record.scopes.clone()),
            detail: Some(format!("{revoked} token(s) revoked")),
            ..AuditEntry::new("device-revoked")
        })
        .await;
    info!("Unpaired device {}", id);
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Observability
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresenceResponse {
    entries: Vec<PresenceEntry>,
    version: u64,
}

/// Current presence table with its version counter
async fn presence_handler(State(state): State<Arc<AppState>>) -> Json<PresenceResponse> {
    let (entries, version) = state.presence.snapshot().await;
    Json(PresenceResponse { entries, version })
}

/// Recent audit entries, oldest first
async fn audit_handler(State(state): State<Arc<AppState>>) -> Json<Vec<AuditEntry>> {
    Json(state.audit.entries().await)
}

/// Server information response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfo {
    version: String,
    protocol: u32,
    host: String,
    auth_required: bool,
    device_auth_enabled: bool,
    paired_devices: usize,
    pending_requests: usize,
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol: PROTOCOL_VERSION,
        host: state.host.clone(),
        auth_required: state.config.shared_secret.is_some(),
        device_auth_enabled: !state.config.control_ui.dangerously_disable_device_auth,
        paired_devices: state.pairing.list().await.len(),
        pending_requests: state.pairing.pending().await.len(),
    })
}
