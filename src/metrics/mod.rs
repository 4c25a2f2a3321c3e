// src/metrics/mod.rs
// Prometheus metrics surface. In scope as ambient infrastructure (§1) —
// shipping the series to a vendor is not, only exposing them at /metrics.

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Active WebSocket connections across every conversation.
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);

pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    PROMETHEUS_HANDLE
        .set(handle)
        .expect("Prometheus handle already initialized");

    info!("Prometheus metrics initialized");
}

/// GET /metrics
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized".to_string()),
    }
}

/// Record an inbound request to the lifecycle REST surface or the
/// message channel (§6.1/§6.2).
pub fn record_request(request_type: &str) {
    counter!("chat_requests_total", "type" => request_type.to_string()).increment(1);
}

pub fn record_request_duration(request_type: &str, duration_seconds: f64) {
    histogram!("chat_request_duration_seconds", "type" => request_type.to_string()).record(duration_seconds);
}

/// Record a completed AI job (§4.E), `outcome` one of "ok" / "error" / "timeout".
pub fn record_ai_job(outcome: &str, duration_seconds: f64) {
    counter!("chat_ai_jobs_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("chat_ai_job_duration_seconds").record(duration_seconds);
}

/// Record a shed (dropped-for-backpressure) AI job (§4.F.3).
pub fn record_ai_job_shed() {
    counter!("chat_ai_jobs_shed_total").increment(1);
}

/// Record a Conversation Cache lookup result (§4.C).
pub fn record_cache_result(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("chat_cache_lookups_total", "result" => result).increment(1);
}

/// Record a delivery failure recorded against a conversation (§9/§5).
pub fn record_delivery_failure(kind: &str) {
    counter!("chat_failures_total", "kind" => kind.to_string()).increment(1);
}

/// Set the current ingress queue depth for a conversation.
pub fn set_queue_depth(conversation_id: &str, depth: usize) {
    gauge!("chat_queue_depth", "conversation_id" => conversation_id.to_string()).set(depth as f64);
}

pub fn connection_opened() {
    let count = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    gauge!("chat_active_connections").set(count as f64);
}

pub fn connection_closed() {
    let count = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::SeqCst) - 1;
    gauge!("chat_active_connections").set(count as f64);
}

/// Timing helper; records a request + its duration on drop, mirroring
/// `record_request`/`record_request_duration` being called in pairs.
pub struct RequestTimer {
    start: Instant,
    request_type: String,
}

impl RequestTimer {
    pub fn new(request_type: &str) -> Self {
        record_request(request_type);
        Self {
            start: Instant::now(),
            request_type: request_type.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_request_duration(&self.request_type, duration);
    }
}
