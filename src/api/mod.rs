// src/api/mod.rs
// HTTP/WS bootstrap (§6.1/§6.2/§6.6): axum::Router wiring onto the
// lifecycle REST surface, the message channel, and the ambient probes.

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .merge(http::lifecycle::router())
        .route("/health", get(http::health_check))
        .route("/ready", get(http::readiness_check))
        .route("/live", get(http::liveness_check))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .route("/ws", get(ws::handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
