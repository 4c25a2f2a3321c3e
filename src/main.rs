// src/main.rs
// Process bootstrap: load configuration, assemble `AppState`, and serve
// the lifecycle REST surface, the message channel, and the ambient
// probes on one axum router (§6's external interfaces).

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_core::config::CONFIG;
use chat_core::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&CONFIG.logging.level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .init();

    info!("starting chat orchestration core");

    CONFIG.validate()?;

    chat_core::metrics::init_metrics();
    info!("metrics exporter ready");

    // No AI engine ships with this core (§6.4/§1) — a deployment that
    // wants AI participants wires a concrete `AiEngine` in here.
    let state = Arc::new(AppState::new(CONFIG.clone(), None).await?);
    info!("application state ready");

    let app = chat_core::api::create_router(state);
    let addr = CONFIG.server.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app).await?;

    Ok(())
}
