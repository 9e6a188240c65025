//! HTTP server assembly and lifecycle.

pub mod api;

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use crate::pipeline::ProcessToolchain;

pub use api::{AppState, SharedState};

pub fn build_router(state: SharedState) -> Router {
    let dev_mode = state.config.dev_mode;
    let router = Router::new()
        .route("/health", get(api::health))
        .route("/api/token", get(api::issue_token))
        .route("/api/manifest", post(api::resolve_manifest))
        .route("/api/build", post(api::create_build))
        .route("/api/build/{id}/stream", get(api::stream_progress))
        .route("/api/build/{id}/download", get(api::download))
        .with_state(state);
    if dev_mode {
        // Local UI development runs on a different origin.
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Bind and serve until ctrl-c.
pub async fn start_server(config: ServerConfig) -> anyhow::Result<()> {
    let port = config.port;
    let state = AppState::new(config, Arc::new(ProcessToolchain));
    let app = build_router(state);

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {}", port))?;
    eprintln!("[server] listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    eprintln!("[server] shutting down");
}
