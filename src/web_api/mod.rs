//! WebAPI - REST API Endpoints
//!
//! ## Responsibilities
//!
//! - Supervisor status and control routes
//! - Liveness endpoint
//! - Operator diagnostics (camera test, alert test)

mod routes;

pub use routes::create_router;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Liveness endpoint
///
/// 503 only when a run is wanted and no relay process exists.
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.supervisor.status();
    let live = snapshot.is_live() && !state.supervisor.is_shut_down();

    let response = HealthResponse {
        status: if live { "ok" } else { "unhealthy" },
        version: env!("CARGO_PKG_VERSION"),
        uptime_sec: (chrono::Utc::now() - state.started_at).num_seconds().max(0) as u64,
        desired_running: snapshot.desired_running,
        process_alive: snapshot.process_alive,
        relay_state: snapshot.relay_state,
    };

    let code = if live {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
