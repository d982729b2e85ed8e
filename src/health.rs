//! Health check endpoint for deployment platform monitoring.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::database::Database;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub database: &'static str,
    pub version: &'static str,
    pub build_timestamp: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<&'static str>,
}

/// Health check handler. Returns 503 when the database cannot be reached.
pub async fn health_handler(State(db): State<Arc<Database>>) -> (StatusCode, Json<HealthReport>) {
    let (status_code, status, database) = match db.health_check().await {
        Ok(()) => (StatusCode::OK, "ok", "ok"),
        Err(e) => {
            tracing::error!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "degraded", "error")
        }
    };

    (
        status_code,
        Json(HealthReport {
            status,
            database,
            version: env!("CARGO_PKG_VERSION"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
            git_commit: option_env!("GIT_COMMIT"),
        }),
    )
}
