// src/api/http/health.rs
// Health/readiness/liveness probes (§6.2's Health entry) for load
// balancers and process supervisors.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    conversations: usize,
    queue_depths: HashMap<String, usize>,
    storage: &'static str,
}

/// GET /health — `status` degrades to `"degraded"` if the storage probe
/// fails; the process itself stays up (no panic, no process exit).
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue_depths = state.conversations.queue_depths().await;
    let storage_ok = state.storage.get_conversation("__health_probe__").await.is_ok();

    let response = HealthResponse {
        status: if storage_ok { "ok" } else { "degraded" },
        connections: queue_depths.keys().map(|id| state.connections.connection_count(id)).sum(),
        conversations: queue_depths.len(),
        queue_depths,
        storage: if storage_ok { "ok" } else { "error" },
    };

    let code = if storage_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(response))
}

/// GET /ready — readiness is identical to the storage half of `/health`;
/// kept as a separate route since orchestrators probe it differently.
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let storage_ok = state.storage.get_conversation("__health_probe__").await.is_ok();
    let body = serde_json::json!({ "status": if storage_ok { "ready" } else { "not_ready" } });
    let code = if storage_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, Json(body))
}

/// GET /live — the process can answer HTTP at all.
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "alive"})))
}
