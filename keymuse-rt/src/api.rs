//! HTTP server setup and routing
//!
//! Serves the WebSocket upgrade endpoint plus the ancillary health,
//! status and metrics routes.

use crate::analysis::PatternExtractor;
use crate::collab::SessionValidator;
use crate::qos::{ConnectionPool, PoolMetrics};
use crate::session::SessionStore;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use keymuse_common::config::Config;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<SessionStore>,
    pub connections: Arc<ConnectionPool>,
    pub extractor: Arc<PatternExtractor>,
    pub validator: Arc<dyn SessionValidator>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

/// Build the application router
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/ws", get(crate::gateway::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

/// Health check endpoint
async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Status endpoint
async fn status(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "keymuse-rt",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "uptime_secs": ctx.started_at.elapsed().as_secs(),
        "connections": ctx.connections.connection_count(),
        "sessions": ctx.store.session_count(),
    }))
}

/// Metrics accessor: connections, message rate, latency, bandwidth
async fn metrics(State(ctx): State<AppContext>) -> Json<PoolMetrics> {
    Json(ctx.connections.metrics())
}
