//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub backplane: String,
    pub connections: usize,
    pub hosted_sinks: usize,
    /// Not tracked by the Redis store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<usize>,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let backplane = state.backplane();
    let ready = backplane.ready().await.is_ok();
    let groups = state.registry.membership().group_count().await.ok().flatten();

    let overall_status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        overall_status,
        Json(HealthResponse {
            status: if ready { "healthy" } else { "unhealthy" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backplane: backplane.kind().to_string(),
            connections: state.registry.connection_count(),
            hosted_sinks: backplane.hosted_count(),
            groups,
        }),
    )
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe (checks the backplane's external dependencies)
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    match state.backplane().ready().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
