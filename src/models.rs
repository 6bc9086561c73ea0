//! Shared API models

use crate::alert_dispatcher::ChannelResult;
use crate::relay_process::RelayState;
use serde::{Deserialize, Serialize};

/// Success envelope; failures are rendered by `Error::into_response`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self { ok: true, data }
    }
}

/// Liveness response (`/healthz`)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// "ok" or "unhealthy"
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_sec: u64,
    pub desired_running: bool,
    pub process_alive: bool,
    pub relay_state: RelayState,
}

/// Alert test results (`/api/test-alerts`)
#[derive(Debug, Clone, Serialize)]
pub struct AlertTestResponse {
    pub configured: Vec<&'static str>,
    pub results: Vec<ChannelResult>,
}
