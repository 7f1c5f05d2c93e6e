use crate::AppState;
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the database or storage root is unusable
    pub status: String,
    pub database: String,
    pub storage: String,
    /// `disabled` unless virus scanning is switched on
    pub scanner: String,
    /// Sessions in memory, committed tombstones included
    pub tracked_uploads: usize,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Database or storage unavailable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database_ok = state.db.ping().await.is_ok();
    let storage_ok = tokio::fs::metadata(state.reassembler.catalog().artifacts().root())
        .await
        .is_ok_and(|m| m.is_dir());

    // An unreachable scanner fails uploads at commit time, not the whole service
    let scanner = if !state.config.enable_virus_scan {
        "disabled"
    } else if state.scanner.health_check().await {
        "connected"
    } else {
        "unreachable"
    };

    let healthy = database_ok && storage_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            database: if database_ok { "connected" } else { "disconnected" }.to_string(),
            storage: if storage_ok { "available" } else { "missing" }.to_string(),
            scanner: scanner.to_string(),
            tracked_uploads: state.reassembler.sessions().len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}
