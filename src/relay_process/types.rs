//! RelayProcess types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Relay source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Live camera feed
    Normal,
    /// Looped static image with silent audio
    Fallback,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Normal => "normal",
            RelayMode::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for RelayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay lifecycle
///
/// Stopped → Starting → Running → Degraded → Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    /// Alive (or just died) but not producing useful output
    Degraded,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::Stopped => write!(f, "stopped"),
            RelayState::Starting => write!(f, "starting"),
            RelayState::Running => write!(f, "running"),
            RelayState::Degraded => write!(f, "degraded"),
        }
    }
}

/// Local HLS output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutput {
    pub dir: PathBuf,
    pub segment_seconds: u32,
    pub list_size: u32,
}

impl SegmentOutput {
    pub const PLAYLIST: &'static str = "stream.m3u8";
    pub const SEGMENT_PATTERN: &'static str = "segment_%03d.ts";

    pub fn playlist_path(&self) -> PathBuf {
        self.dir.join(Self::PLAYLIST)
    }

    pub fn segment_pattern(&self) -> PathBuf {
        self.dir.join(Self::SEGMENT_PATTERN)
    }
}

/// Where the relay writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// RTMP push (e.g. a live-streaming ingest)
    Push { url: String, stream_key: String },
    /// Segmented HLS files in a local directory
    Segment(SegmentOutput),
}

impl OutputTarget {
    /// Description safe for logs and the status API (stream key masked)
    pub fn describe(&self) -> String {
        match self {
            OutputTarget::Push { url, .. } => {
                format!("push:{}/****", url.trim_end_matches('/'))
            }
            OutputTarget::Segment(seg) => format!("segment:{}", seg.playlist_path().display()),
        }
    }

    /// Full push URL including the stream key
    pub fn push_url(&self) -> Option<String> {
        match self {
            OutputTarget::Push { url, stream_key } if stream_key.is_empty() => Some(url.clone()),
            OutputTarget::Push { url, stream_key } => {
                Some(format!("{}/{}", url.trim_end_matches('/'), stream_key))
            }
            OutputTarget::Segment(_) => None,
        }
    }
}

/// How a relay process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub success: bool,
    /// Killed after the grace period ran out
    pub forced: bool,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus, forced: bool) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
            forced,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code)?,
            None => write!(f, "terminated by signal")?,
        }
        if self.forced {
            write!(f, " (killed)")?;
        }
        Ok(())
    }
}

/// Non-blocking liveness result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// No relay handle exists
    NotRunning,
    Alive,
    Exited(ExitInfo),
}

/// Events pushed by the output monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEventKind {
    /// A failure marker matched in the relay's diagnostic output
    ConnectionLost { line: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    /// Identifies the process run that produced the event
    pub run_id: Uuid,
    pub kind: RelayEventKind,
}
