//! Read-only status HTTP surface.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use mukit_core::{EngineStatus, StatusSource};

use crate::health;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub source: Arc<dyn StatusSource>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/healthz", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind `host:port` and serve until `cancel` fires.
pub async fn serve(host: &str, port: u16, source: Arc<dyn StatusSource>, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "status server listening");

    axum::serve(listener, build_router(AppState { source }))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("status server stopped");
    Ok(())
}

/// GET /
async fn root_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /healthz. 503 when the reconciliation ticker has stalled.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let resp = health::health_check(&state.source.status(), Utc::now());
    let code = if resp.engine_responsive {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(resp))
}

/// GET /status
async fn status_handler(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.source.status())
}
