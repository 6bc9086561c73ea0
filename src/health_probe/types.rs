//! HealthProbe types

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Probe layers, in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeLayer {
    /// ICMP ping
    Ping,
    /// TCP connect to the camera port
    Port,
    /// RTSP session negotiation (ffprobe)
    Protocol,
}

impl std::fmt::Display for ProbeLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeLayer::Ping => write!(f, "ping"),
            ProbeLayer::Port => write!(f, "port"),
            ProbeLayer::Protocol => write!(f, "protocol"),
        }
    }
}

/// Outcome of a single probe layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum LayerOutcome {
    Passed,
    Failed(String),
    TimedOut,
    /// Not run because an earlier layer failed, or disabled by config
    Skipped,
}

impl LayerOutcome {
    pub fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => LayerOutcome::Passed,
            Err(Error::ProbeTimeout(_)) => LayerOutcome::TimedOut,
            Err(e) => LayerOutcome::Failed(e.to_string()),
        }
    }

    /// Passed or skipped
    pub fn is_ok(&self) -> bool {
        matches!(self, LayerOutcome::Passed | LayerOutcome::Skipped)
    }
}

/// Negotiated stream metadata from the protocol probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub video_tracks: u32,
    pub audio_tracks: u32,
}

impl StreamInfo {
    /// "1920x1080" or None when the camera did not report dimensions
    pub fn resolution(&self) -> Option<String> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(format!("{}x{}", w, h)),
            _ => None,
        }
    }
}

/// Tri-state camera health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Reachable,
    Unreachable,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Unknown => write!(f, "unknown"),
            HealthStatus::Reachable => write!(f, "reachable"),
            HealthStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Why a verdict is Unreachable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeFailure {
    pub layer: ProbeLayer,
    pub reason: String,
}

/// Result of one health evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthVerdict {
    pub status: HealthStatus,
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_info: Option<StreamInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ProbeFailure>,
}

impl HealthVerdict {
    /// Never evaluated
    pub fn unknown() -> Self {
        Self {
            status: HealthStatus::Unknown,
            checked_at: None,
            stream_info: None,
            failure: None,
        }
    }

    pub fn reachable(stream_info: Option<StreamInfo>) -> Self {
        Self {
            status: HealthStatus::Reachable,
            checked_at: Some(Utc::now()),
            stream_info,
            failure: None,
        }
    }

    pub fn unreachable(layer: ProbeLayer, reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unreachable,
            checked_at: Some(Utc::now()),
            stream_info: None,
            failure: Some(ProbeFailure {
                layer,
                reason: reason.into(),
            }),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status == HealthStatus::Reachable
    }
}

/// Per-layer breakdown of one probe run (operator diagnostics)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub camera: String,
    pub ping: LayerOutcome,
    pub port: LayerOutcome,
    pub protocol: LayerOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_info: Option<StreamInfo>,
    pub checked_at: DateTime<Utc>,
}

impl ProbeReport {
    /// All layers passed (disabled layers count as passed)
    pub fn overall(&self) -> bool {
        self.ping.is_ok() && self.port.is_ok() && self.protocol == LayerOutcome::Passed
    }

    /// Collapse the report into a verdict (first failing layer wins)
    pub fn verdict(&self) -> HealthVerdict {
        for (layer, outcome) in [
            (ProbeLayer::Ping, &self.ping),
            (ProbeLayer::Port, &self.port),
            (ProbeLayer::Protocol, &self.protocol),
        ] {
            match outcome {
                LayerOutcome::Failed(reason) => {
                    return HealthVerdict::unreachable(layer, reason.clone())
                }
                LayerOutcome::TimedOut => return HealthVerdict::unreachable(layer, "timeout"),
                _ => {}
            }
        }

        if self.protocol != LayerOutcome::Passed {
            return HealthVerdict::unreachable(ProbeLayer::Protocol, "protocol probe did not run");
        }

        HealthVerdict::reachable(self.stream_info.clone())
    }
}

// ========================================
// ffprobe output
// ========================================

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
}

/// Parse `ffprobe -print_format json -show_streams` output
///
/// Empty stream lists and streams without video are rejected: a camera that
/// negotiates nothing watchable is not healthy.
pub fn parse_ffprobe_output(raw: &str) -> Result<StreamInfo> {
    let output: FfprobeOutput = serde_json::from_str(raw)?;

    let mut info = StreamInfo {
        width: None,
        height: None,
        fps: None,
        video_tracks: 0,
        audio_tracks: 0,
    };

    for stream in &output.streams {
        match stream.codec_type.as_deref() {
            Some("video") => {
                info.video_tracks += 1;
                if info.width.is_none() {
                    info.width = stream.width;
                    info.height = stream.height;
                    info.fps = stream.r_frame_rate.as_deref().and_then(parse_frame_rate);
                }
            }
            Some("audio") => info.audio_tracks += 1,
            _ => {}
        }
    }

    if info.video_tracks == 0 {
        return Err(Error::ProbeFailure(
            "camera negotiated no video stream".to_string(),
        ));
    }

    Ok(info)
}

/// "30000/1001" -> 29.97
fn parse_frame_rate(raw: &str) -> Option<f64> {
    let (num, den) = raw.split_once('/')?;
    let num: f64 = num.trim().parse().ok()?;
    let den: f64 = den.trim().parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}
