//! Relay invocation builder
//!
//! normal / fallback × push / segment の組み合わせを1箇所で組み立てる。

use super::types::{OutputTarget, RelayMode};
use crate::error::{Error, Result};
use std::path::PathBuf;
use tokio::process::Command;

/// Builds the OS command for one relay run
pub trait RelayCommandFactory: Send + Sync {
    fn build(&self, mode: RelayMode, target: &OutputTarget) -> Command;
}

/// Output encoding parameters
#[derive(Debug, Clone)]
pub struct EncodingConfig {
    /// "1920x1080"
    pub resolution: String,
    pub fps: u32,
    /// "4500k"
    pub bitrate: String,
    pub bufsize: String,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            resolution: "1920x1080".to_string(),
            fps: 30,
            bitrate: "4500k".to_string(),
            bufsize: "9000k".to_string(),
        }
    }
}

/// ffmpeg-backed relay
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    pub ffmpeg_path: PathBuf,
    /// Camera URL with credentials
    pub source_url: String,
    pub fallback_image: PathBuf,
    pub encoding: EncodingConfig,
}

impl FfmpegCommand {
    /// Argument vector for a run (without the program name)
    pub fn args(&self, mode: RelayMode, target: &OutputTarget) -> Vec<String> {
        let enc = &self.encoding;
        let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "warning".into()];

        match mode {
            RelayMode::Normal => {
                args.extend(["-rtsp_transport", "tcp", "-i"].map(String::from));
                args.push(self.source_url.clone());
            }
            RelayMode::Fallback => {
                args.extend(["-re", "-loop", "1", "-framerate"].map(String::from));
                args.push(enc.fps.to_string());
                args.push("-i".into());
                args.push(self.fallback_image.display().to_string());
                // 無音トラックを合成（配信先が音声必須の場合があるため）
                args.extend(
                    [
                        "-f",
                        "lavfi",
                        "-i",
                        "anullsrc=channel_layout=stereo:sample_rate=44100",
                        "-map",
                        "0:v",
                        "-map",
                        "1:a",
                    ]
                    .map(String::from),
                );
            }
        }

        args.extend(
            ["-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency", "-b:v"]
                .map(String::from),
        );
        args.push(enc.bitrate.clone());
        args.push("-maxrate".into());
        args.push(enc.bitrate.clone());
        args.push("-bufsize".into());
        args.push(enc.bufsize.clone());
        args.push("-s".into());
        args.push(enc.resolution.clone());
        args.push("-r".into());
        args.push(enc.fps.to_string());
        args.push("-g".into());
        args.push(enc.fps.saturating_mul(2).to_string());
        args.extend(["-pix_fmt", "yuv420p"].map(String::from));

        args.extend(["-c:a", "aac", "-b:a", "128k", "-ar", "44100"].map(String::from));

        match target {
            OutputTarget::Push { .. } => {
                args.extend(["-f", "flv"].map(String::from));
                args.push(target.push_url().unwrap_or_default());
            }
            OutputTarget::Segment(seg) => {
                args.extend(["-f", "hls", "-hls_time"].map(String::from));
                args.push(seg.segment_seconds.to_string());
                args.push("-hls_list_size".into());
                args.push(seg.list_size.to_string());
                args.extend(["-hls_flags", "delete_segments", "-hls_segment_filename"].map(String::from));
                args.push(seg.segment_pattern().display().to_string());
                args.push(seg.playlist_path().display().to_string());
            }
        }

        args
    }
}

impl RelayCommandFactory for FfmpegCommand {
    fn build(&self, mode: RelayMode, target: &OutputTarget) -> Command {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(self.args(mode, target));
        cmd
    }
}

/// Check that ffmpeg runs; returns its version line
pub async fn check_ffmpeg(ffmpeg_path: &std::path::Path) -> Result<String> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .await
        .map_err(|e| Error::ProcessLaunch(format!("ffmpeg not found: {}", e)))?;

    if !output.status.success() {
        return Err(Error::ProcessLaunch(
            "ffmpeg version check failed".to_string(),
        ));
    }

    let version = String::from_utf8_lossy(&output.stdout);
    let first_line = version.lines().next().unwrap_or("unknown");
    Ok(first_line.to_string())
}
