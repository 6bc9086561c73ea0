//! HealthProbe - Layered Camera Reachability
//!
//! ## Responsibilities
//!
//! - ICMP ping (system `ping`, bounded)
//! - TCP connect to the RTSP port (bounded)
//! - RTSP negotiation via ffprobe (bounded, captures stream metadata)
//!
//! 各レイヤーは安い順に実行し、最初の失敗で打ち切る。
//! リトライはしない（制御ループの責務）。

mod types;

pub use types::{
    parse_ffprobe_output, HealthStatus, HealthVerdict, LayerOutcome, ProbeFailure, ProbeLayer,
    ProbeReport, StreamInfo,
};

use crate::camera_endpoint::CameraEndpoint;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;

/// Probe timeouts and tool locations
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Some container hosts cannot send ICMP; disable to rely on port + protocol
    pub ping_enabled: bool,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub protocol_timeout: Duration,
    pub ping_path: PathBuf,
    pub ffprobe_path: PathBuf,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_enabled: true,
            ping_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(5),
            protocol_timeout: Duration::from_secs(15),
            ping_path: PathBuf::from("ping"),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

/// Anything that can produce a health verdict for the camera
#[async_trait]
pub trait CameraProbe: Send + Sync {
    async fn evaluate(&self, endpoint: &CameraEndpoint) -> HealthVerdict;

    /// Per-layer breakdown; defaults to a report derived from `evaluate`
    async fn report(&self, endpoint: &CameraEndpoint) -> ProbeReport {
        let verdict = self.evaluate(endpoint).await;
        let failed = |layer: ProbeLayer| match &verdict.failure {
            Some(f) if f.layer == layer => LayerOutcome::Failed(f.reason.clone()),
            _ if verdict.is_reachable() => LayerOutcome::Passed,
            _ => LayerOutcome::Skipped,
        };
        ProbeReport {
            camera: endpoint.to_string(),
            ping: failed(ProbeLayer::Ping),
            port: failed(ProbeLayer::Port),
            protocol: failed(ProbeLayer::Protocol),
            stream_info: verdict.stream_info.clone(),
            checked_at: chrono::Utc::now(),
        }
    }
}

/// Three-layer probe against a real camera
pub struct HealthProbe {
    config: ProbeConfig,
}

impl HealthProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Layer 1: single ICMP echo
    pub async fn ping(&self, endpoint: &CameraEndpoint) -> Result<()> {
        let wait_secs = self.config.ping_timeout.as_secs().max(1).to_string();

        let child = Command::new(&self.config.ping_path)
            .args(["-c", "1", "-W", &wait_secs, endpoint.host()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProbeFailure(format!("ping spawn failed: {}", e)))?;

        // ping自身の-Wより少し長めに待つ
        let bound = self.config.ping_timeout + Duration::from_secs(1);
        match timeout(bound, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(Error::ProbeFailure(format!(
                "ping to {} failed ({})",
                endpoint.host(),
                output.status
            ))),
            Ok(Err(e)) => Err(Error::ProbeFailure(format!("ping execution failed: {}", e))),
            Err(_) => Err(Error::ProbeTimeout(format!(
                "ping to {} exceeded {:?}",
                endpoint.host(),
                bound
            ))),
        }
    }

    /// Layer 2: TCP connect to the camera port
    pub async fn connect(&self, endpoint: &CameraEndpoint) -> Result<()> {
        let addr = (endpoint.host(), endpoint.port());
        match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(Error::ProbeFailure(format!(
                "connect to {} failed: {}",
                endpoint, e
            ))),
            Err(_) => Err(Error::ProbeTimeout(format!(
                "connect to {} exceeded {:?}",
                endpoint, self.config.connect_timeout
            ))),
        }
    }

    /// Layer 3: negotiate the RTSP session with ffprobe
    ///
    /// kill_on_drop so a timed-out ffprobe is reaped when the future is dropped.
    pub async fn negotiate(&self, endpoint: &CameraEndpoint) -> Result<StreamInfo> {
        let socket_timeout_us = self.config.protocol_timeout.as_micros().to_string();

        let child = Command::new(&self.config.ffprobe_path)
            .args([
                "-v", "quiet",
                "-print_format", "json",
                "-show_streams",
                "-rtsp_transport", "tcp",
                "-timeout", &socket_timeout_us,
                endpoint.url(),
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ProbeFailure(format!("ffprobe spawn failed: {}", e)))?;

        match timeout(self.config.protocol_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(Error::ProbeFailure(format!(
                        "ffprobe failed ({}): {}",
                        output.status,
                        stderr.trim()
                    )));
                }
                let stdout = String::from_utf8_lossy(&output.stdout);
                parse_ffprobe_output(&stdout).map_err(|e| match e {
                    Error::ProbeFailure(msg) => Error::ProbeFailure(msg),
                    other => Error::ProbeFailure(format!("unreadable ffprobe output: {}", other)),
                })
            }
            Ok(Err(e)) => Err(Error::ProbeFailure(format!("ffprobe execution failed: {}", e))),
            Err(_) => {
                tracing::warn!(
                    camera = %endpoint,
                    timeout_sec = self.config.protocol_timeout.as_secs(),
                    "ffprobe timeout, process killed via kill_on_drop"
                );
                Err(Error::ProbeTimeout(format!(
                    "RTSP negotiation exceeded {:?}",
                    self.config.protocol_timeout
                )))
            }
        }
    }
}

#[async_trait]
impl CameraProbe for HealthProbe {
    async fn evaluate(&self, endpoint: &CameraEndpoint) -> HealthVerdict {
        let verdict = self.report(endpoint).await.verdict();

        match &verdict.failure {
            Some(failure) => tracing::warn!(
                camera = %endpoint,
                layer = %failure.layer,
                reason = %failure.reason,
                "Camera health check failed"
            ),
            None => tracing::debug!(camera = %endpoint, "Camera healthy"),
        }

        verdict
    }

    async fn report(&self, endpoint: &CameraEndpoint) -> ProbeReport {
        let mut report = ProbeReport {
            camera: endpoint.to_string(),
            ping: LayerOutcome::Skipped,
            port: LayerOutcome::Skipped,
            protocol: LayerOutcome::Skipped,
            stream_info: None,
            checked_at: chrono::Utc::now(),
        };

        if self.config.ping_enabled {
            report.ping = LayerOutcome::from_result(&self.ping(endpoint).await);
            if !report.ping.is_ok() {
                return report;
            }
        }

        report.port = LayerOutcome::from_result(&self.connect(endpoint).await);
        if !report.port.is_ok() {
            return report;
        }

        match self.negotiate(endpoint).await {
            Ok(info) => {
                tracing::debug!(
                    camera = %endpoint,
                    resolution = ?info.resolution(),
                    fps = ?info.fps,
                    video_tracks = info.video_tracks,
                    audio_tracks = info.audio_tracks,
                    "RTSP negotiation succeeded"
                );
                report.protocol = LayerOutcome::Passed;
                report.stream_info = Some(info);
            }
            Err(e) => report.protocol = LayerOutcome::from_result(&Err(e)),
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn probe_without_ping(ffprobe: &str) -> HealthProbe {
        HealthProbe::new(ProbeConfig {
            ping_enabled: false,
            connect_timeout: Duration::from_millis(500),
            protocol_timeout: Duration::from_secs(2),
            ffprobe_path: PathBuf::from(ffprobe),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_connect_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = CameraEndpoint::parse(&format!("rtsp://127.0.0.1:{}/live", port)).unwrap();

        let probe = probe_without_ping("ffprobe");
        assert!(probe.connect(&endpoint).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_closed_port() {
        // bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = CameraEndpoint::parse(&format!("rtsp://127.0.0.1:{}/live", port)).unwrap();

        let probe = probe_without_ping("ffprobe");
        assert!(matches!(
            probe.connect(&endpoint).await,
            Err(Error::ProbeFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_port_short_circuits_protocol() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = CameraEndpoint::parse(&format!("rtsp://127.0.0.1:{}/live", port)).unwrap();

        let probe = probe_without_ping("/nonexistent/ffprobe");
        let report = probe.report(&endpoint).await;

        assert_eq!(report.ping, LayerOutcome::Skipped);
        assert!(matches!(report.port, LayerOutcome::Failed(_)));
        assert_eq!(report.protocol, LayerOutcome::Skipped);

        let verdict = probe.evaluate(&endpoint).await;
        assert_eq!(verdict.status, HealthStatus::Unreachable);
        assert_eq!(verdict.failure.unwrap().layer, ProbeLayer::Port);
    }

    #[tokio::test]
    async fn test_missing_ffprobe_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = CameraEndpoint::parse(&format!("rtsp://127.0.0.1:{}/live", port)).unwrap();

        let probe = probe_without_ping("/nonexistent/ffprobe");
        let verdict = probe.evaluate(&endpoint).await;

        assert_eq!(verdict.status, HealthStatus::Unreachable);
        assert_eq!(verdict.failure.unwrap().layer, ProbeLayer::Protocol);
    }
}
