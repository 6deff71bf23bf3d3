//! Hookgate HTTP API
//!
//! Provides:
//! - `POST /slack/events`, `/slack/commands`, `/slack/interactive`: webhook ingress
//! - `GET /slack/install`, `/slack/oauth/callback`: OAuth install flow
//! - `GET /health`, `/health/live`, `/health/ready`: health checks

pub mod error;
pub mod slack;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hg_dispatch::{CredentialExchange, DispatchCoordinator};
use serde_json::json;
use std::sync::Arc;

pub use error::{ApiError, ApiResult, HttpError};

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<DispatchCoordinator>,
    /// Absent when no OAuth client credentials are configured
    pub exchange: Option<Arc<CredentialExchange>>,
}

impl AppState {
    pub fn new(coordinator: Arc<DispatchCoordinator>) -> Self {
        Self {
            coordinator,
            exchange: None,
        }
    }

    pub fn with_exchange(mut self, exchange: Arc<CredentialExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }
}

/// Create the public router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/slack/events", post(slack::ingress_handler))
        .route("/slack/commands", post(slack::ingress_handler))
        .route("/slack/interactive", post(slack::ingress_handler))
        .route("/slack/install", get(slack::install_handler))
        .route("/slack/oauth/callback", get(slack::oauth_callback_handler))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(state)
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn liveness_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "LIVE" }))
}

/// Ready while the worker pool accepts work
async fn readiness_handler(State(state): State<AppState>) -> Response {
    let pool = state.coordinator.pool();
    if pool.is_running() {
        Json(json!({
            "status": "READY",
            "available_capacity": pool.available_capacity(),
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError {
                error: "NOT_READY".to_string(),
                message: "Worker pool is draining".to_string(),
                details: None,
            }),
        )
            .into_response()
    }
}
