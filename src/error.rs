//! Error handling for the camstream supervisor

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A health probe layer exceeded its time bound
    #[error("Probe timeout: {0}")]
    ProbeTimeout(String),

    /// A health probe layer failed outright
    #[error("Probe failure: {0}")]
    ProbeFailure(String),

    /// Relay executable missing or rejected its arguments
    #[error("Relay launch failed: {0}")]
    ProcessLaunch(String),

    /// Relay process exited while it was expected to run
    #[error("Relay exited unexpectedly: {0}")]
    ProcessExited(String),

    /// Relay output reported a lost connection
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Segment output stopped advancing
    #[error("Output stalled: {0}")]
    OutputStalled(String),

    /// Reconnect budget used up for the current cycle
    #[error("Max reconnect attempts exceeded ({0})")]
    MaxAttemptsExceeded(u32),

    /// Alert channel delivery failure
    #[error("Alert channel {channel} failed: {message}")]
    AlertChannel { channel: String, message: String },

    /// Conflicting relay request (another mode is active)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Control loop is gone (shut down or crashed)
    #[error("Supervisor unavailable: {0}")]
    SupervisorUnavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable code used in API responses
    pub fn code(&self) -> &'static str {
        match self {
            Error::ProbeTimeout(_) => "PROBE_TIMEOUT",
            Error::ProbeFailure(_) => "PROBE_FAILURE",
            Error::ProcessLaunch(_) => "PROCESS_LAUNCH_FAILURE",
            Error::ProcessExited(_) => "PROCESS_EXITED",
            Error::ConnectionLost(_) => "CONNECTION_LOST",
            Error::OutputStalled(_) => "OUTPUT_STALLED",
            Error::MaxAttemptsExceeded(_) => "MAX_ATTEMPTS_EXCEEDED",
            Error::AlertChannel { .. } => "ALERT_CHANNEL_FAILURE",
            Error::Conflict(_) => "CONFLICT",
            Error::Config(_) => "CONFIG_ERROR",
            Error::SupervisorUnavailable(_) => "SUPERVISOR_UNAVAILABLE",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::SupervisorUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ProbeTimeout(_) | Error::ProbeFailure(_) | Error::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Error::AlertChannel { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_code = self.code();
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_and_status() {
        let err = Error::Conflict("fallback relay active".to_string());
        assert_eq!(err.code(), "CONFLICT");
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err = Error::SupervisorUnavailable("loop stopped".to_string());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        let err = Error::OutputStalled("no playlist written".to_string());
        assert_eq!(err.code(), "OUTPUT_STALLED");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = Error::MaxAttemptsExceeded(3);
        assert_eq!(err.to_string(), "Max reconnect attempts exceeded (3)");
    }
}
