//! Status snapshot published by the control loop

use crate::health_probe::{HealthStatus, ProbeFailure, StreamInfo};
use crate::relay_process::{RelayMode, RelayState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Read-only view of the supervisor, replaced after every loop mutation
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatusSnapshot {
    /// Relay process up and past its startup window
    pub is_streaming: bool,
    pub mode: Option<RelayMode>,
    pub relay_state: RelayState,
    pub camera_health: HealthStatus,
    pub reconnect_attempts: u32,
    /// Relay uptime, human readable
    pub uptime: String,
    pub relay_uptime_seconds: u64,
    /// Output destination with the stream key masked
    pub output_target: String,
    /// Camera URL with the password masked
    pub camera: String,
    /// Operator wants the relay running
    pub desired_running: bool,
    /// Reconnect budget exhausted, waiting for recovery or operator
    pub gave_up: bool,
    pub process_alive: bool,
    pub relay_pid: Option<u32>,
    pub relay_started_at: Option<DateTime<Utc>>,
    pub last_output_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub stream_info: Option<StreamInfo>,
    pub health_failure: Option<ProbeFailure>,
    /// Segment output only: playlist written recently
    pub output_fresh: Option<bool>,
    /// Seconds until a scheduled reconnect fires
    pub reconnect_in_seconds: Option<u64>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StreamStatusSnapshot {
    /// Snapshot before the loop has run
    pub fn initial(camera: String, output_target: String) -> Self {
        Self {
            is_streaming: false,
            mode: None,
            relay_state: RelayState::Stopped,
            camera_health: HealthStatus::Unknown,
            reconnect_attempts: 0,
            uptime: format_duration(0),
            relay_uptime_seconds: 0,
            output_target,
            camera,
            desired_running: false,
            gave_up: false,
            process_alive: false,
            relay_pid: None,
            relay_started_at: None,
            last_output_at: None,
            last_health_check: None,
            stream_info: None,
            health_failure: None,
            output_fresh: None,
            reconnect_in_seconds: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Liveness: fine unless a run is wanted and no process exists
    pub fn is_live(&self) -> bool {
        !self.desired_running || self.process_alive
    }
}

/// "45s", "3m 7s", "2h 5m 0s"
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!(
            "{}h {}m {}s",
            seconds / 3600,
            (seconds % 3600) / 60,
            seconds % 60
        )
    }
}
