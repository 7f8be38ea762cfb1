//! System endpoints: health check.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use utoipa::ToSchema;

use crate::api::dto::QueueDepthDto;
use crate::app_state::AppState;
use crate::config::AppRole;

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: String,
    timestamp: String,
    version: String,
    role: String,
    /// `None` when the queue backend is unreachable.
    queues: Option<Vec<QueueDepthDto>>,
}

fn role_name(role: AppRole) -> &'static str {
    match role {
        AppRole::Api => "api",
        AppRole::Worker => "worker",
        AppRole::All => "all",
    }
}

/// `GET /health`: Service health status.
#[utoipa::path(
    get,
    path = "/health",
    tag = "System",
    summary = "Health check",
    description = "Returns service health, version, role and per-topic queue depths. Reports `degraded` when the queue backend cannot be reached.",
    responses(
        (status = 200, description = "Service is healthy or degraded", body = HealthResponse),
    )
)]
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let (status, queues) = match state.jobs.depths().await {
        Ok(depths) => (
            "healthy",
            Some(
                depths
                    .into_iter()
                    .map(|(topic, depth)| QueueDepthDto { topic, depth })
                    .collect(),
            ),
        ),
        Err(err) => {
            tracing::warn!(error = %err, "health check could not read queue depths");
            ("degraded", None)
        }
    };
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            timestamp: Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            role: role_name(state.role).to_string(),
            queues,
        }),
    )
}

/// System routes mounted at the root level.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_handler))
}
