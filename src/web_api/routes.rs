//! API Routes

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::health_probe::ProbeReport;
use crate::models::{AlertTestResponse, ApiResponse};
use crate::state::AppState;
use crate::stream_supervisor::StreamStatusSnapshot;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/healthz", get(super::health_check))
        .route("/api/status", get(get_status))
        // Control
        .route("/api/start", post(start_stream))
        .route("/api/stop", post(stop_stream))
        .route("/api/restart", post(restart_stream))
        // Diagnostics
        .route("/api/camera-test", get(camera_test))
        .route("/api/test-alerts", post(test_alerts))
        .with_state(state)
}

/// Latest supervisor snapshot
async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<StreamStatusSnapshot>> {
    Json(ApiResponse::success(state.supervisor.status()))
}

async fn start_stream(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StreamStatusSnapshot>>> {
    let snapshot = state.supervisor.start().await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

async fn stop_stream(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StreamStatusSnapshot>>> {
    let snapshot = state.supervisor.stop().await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

async fn restart_stream(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<StreamStatusSnapshot>>> {
    let snapshot = state.supervisor.restart().await?;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// Per-layer probe of the camera, run on demand
async fn camera_test(State(state): State<AppState>) -> Json<ApiResponse<ProbeReport>> {
    let report = state.probe.report(&state.config.endpoint).await;
    tracing::info!(
        camera = %state.config.endpoint,
        reachable = report.overall(),
        "Manual camera test"
    );
    Json(ApiResponse::success(report))
}

/// Send a test alert through every channel, ignoring cooldown
async fn test_alerts(State(state): State<AppState>) -> Json<ApiResponse<AlertTestResponse>> {
    let results = state.alerts.test_channels().await;
    Json(ApiResponse::success(AlertTestResponse {
        configured: state.alerts.configured_channels(),
        results,
    }))
}
