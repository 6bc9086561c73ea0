//! Application state
//!
//! Configuration from the environment plus the shared components handed to
//! the HTTP handlers.

use crate::alert_dispatcher::{AlertDispatcher, SmtpConfig, DEFAULT_ALERT_COOLDOWN};
use crate::camera_endpoint::CameraEndpoint;
use crate::error::{Error, Result};
use crate::health_probe::{CameraProbe, ProbeConfig};
use crate::reconnect_policy::PolicyConfig;
use crate::relay_process::{EncodingConfig, OutputTarget, SegmentOutput};
use crate::stream_supervisor::{StreamSupervisor, SupervisorConfig};
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Camera stream URL (may carry credentials; log `endpoint.redacted()` instead)
    pub camera_url: String,
    pub endpoint: CameraEndpoint,
    pub output: OutputTarget,
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    pub supervisor: SupervisorConfig,
    pub probe: ProbeConfig,
    pub encoding: EncodingConfig,
    pub fallback_image: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub smtp: Option<SmtpConfig>,
    pub alert_cooldown: Duration,
}

impl AppConfig {
    /// Load from process environment (`.env` is loaded by main beforehand)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let camera_url = env
            .string("CAMERA_RTSP_URL")
            .ok_or_else(|| Error::Config("CAMERA_RTSP_URL is required".to_string()))?;
        let endpoint = CameraEndpoint::parse(&camera_url)?;

        let output = match env.or("OUTPUT_MODE", "push").to_lowercase().as_str() {
            "push" => OutputTarget::Push {
                url: env.string("RTMP_URL").ok_or_else(|| {
                    Error::Config("RTMP_URL is required when OUTPUT_MODE=push".to_string())
                })?,
                stream_key: env.or("STREAM_KEY", ""),
            },
            "segment" => OutputTarget::Segment(SegmentOutput {
                dir: PathBuf::from(env.or("HLS_OUTPUT_DIR", "/var/lib/camstream/hls")),
                segment_seconds: env.parse("HLS_SEGMENT_SECONDS", 3)?,
                list_size: env.parse("HLS_LIST_SIZE", 10)?,
            }),
            other => {
                return Err(Error::Config(format!(
                    "OUTPUT_MODE must be 'push' or 'segment', got '{}'",
                    other
                )))
            }
        };

        let health_check_interval = env.secs("HEALTH_CHECK_INTERVAL", 30)?;
        if health_check_interval.is_zero() {
            return Err(Error::Config(
                "HEALTH_CHECK_INTERVAL must be at least 1 second".to_string(),
            ));
        }

        let supervisor = SupervisorConfig {
            health_check_interval,
            stop_grace: env.secs("STOP_GRACE_SECS", 10)?,
            stale_output: env.secs("STALE_OUTPUT_SECS", 90)?,
            output_grace: env.secs("OUTPUT_GRACE_SECS", 30)?,
            autostart: env.bool("AUTOSTART", true)?,
            policy: PolicyConfig {
                max_attempts: env.parse("MAX_RECONNECT_ATTEMPTS", 3)?,
                reconnect_delay: env.secs("RECONNECT_DELAY", 10)?,
                fallback_enabled: env.bool("ENABLE_FALLBACK", true)?,
                restart_cooldown: env.secs("RESTART_COOLDOWN_SECS", 300)?,
                stabilization: env.secs("STABILIZATION_SECS", 60)?,
            },
            ..Default::default()
        };

        let probe = ProbeConfig {
            ping_enabled: env.bool("PING_ENABLED", true)?,
            ping_timeout: env.secs("PING_TIMEOUT_SECS", 3)?,
            connect_timeout: env.secs("CONNECT_TIMEOUT_SECS", 5)?,
            protocol_timeout: env.secs("PROBE_TIMEOUT_SECS", 15)?,
            ping_path: PathBuf::from(env.or("PING_PATH", "ping")),
            ffprobe_path: PathBuf::from(env.or("FFPROBE_PATH", "ffprobe")),
        };

        let encoding = EncodingConfig {
            resolution: env.or("STREAM_RESOLUTION", "1920x1080"),
            fps: env.parse("STREAM_FPS", 30)?,
            bitrate: env.or("STREAM_BITRATE", "4500k"),
            bufsize: env.or("STREAM_BUFSIZE", "9000k"),
        };

        // SMTPは全項目そろった場合のみ有効
        let smtp = match (
            env.string("SMTP_HOST"),
            env.string("SMTP_USER"),
            env.string("SMTP_PASSWORD"),
            env.string("ALERT_EMAIL"),
        ) {
            (Some(host), Some(username), Some(password), Some(to)) => Some(SmtpConfig {
                host,
                port: env.parse("SMTP_PORT", 587)?,
                username,
                password,
                to,
            }),
            _ => None,
        };

        Ok(Self {
            camera_url,
            endpoint,
            output,
            host: env.or("HOST", "0.0.0.0"),
            port: env.parse("PORT", 8080)?,
            supervisor,
            probe,
            encoding,
            fallback_image: PathBuf::from(env.or("FALLBACK_IMAGE", "assets/offline.png")),
            ffmpeg_path: PathBuf::from(env.or("FFMPEG_PATH", "ffmpeg")),
            telegram_bot_token: env.string("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env.string("TELEGRAM_CHAT_ID"),
            smtp,
            alert_cooldown: env.secs("ALERT_COOLDOWN_SECS", DEFAULT_ALERT_COOLDOWN.as_secs())?,
        })
    }

    pub fn telegram_configured(&self) -> bool {
        self.telegram_bot_token.is_some() && self.telegram_chat_id.is_some()
    }

    /// Non-fatal problems worth a warning at startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.telegram_configured() && self.smtp.is_none() {
            warnings.push("No alert channel configured (Telegram or SMTP)".to_string());
        }
        if !self.encoding.resolution.contains('x') {
            warnings.push(format!(
                "STREAM_RESOLUTION '{}' should look like 1920x1080",
                self.encoding.resolution
            ));
        }
        if !(1..=60).contains(&self.encoding.fps) {
            warnings.push(format!(
                "STREAM_FPS {} is outside 1-60",
                self.encoding.fps
            ));
        }
        if !self.encoding.bitrate.ends_with('k') {
            warnings.push(format!(
                "STREAM_BITRATE '{}' should end with 'k' (e.g. 4500k)",
                self.encoding.bitrate
            ));
        }
        if self.supervisor.policy.fallback_enabled && !self.fallback_image.exists() {
            warnings.push(format!(
                "Fallback image {} not found; fallback relay will fail to launch",
                self.fallback_image.display()
            ));
        }

        warnings
    }
}

/// Typed access over a key lookup
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Trimmed, non-empty value
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.string(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.string(key) {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("{} has invalid value '{}'", key, raw))),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        match self.string(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "false" | "0" | "no" | "off") => Ok(false),
            Some(v) => Err(Error::Config(format!("{} must be true or false, got '{}'", key, v))),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: Arc<AppConfig>,
    /// Control loop handle
    pub supervisor: StreamSupervisor,
    /// Probe used for on-demand camera tests
    pub probe: Arc<dyn CameraProbe>,
    pub alerts: Arc<AlertDispatcher>,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults_for_push() {
        let config = load(&[
            ("CAMERA_RTSP_URL", "rtsp://admin:pw@192.168.1.10/stream1"),
            ("RTMP_URL", "rtmp://a.rtmp.youtube.com/live2"),
            ("STREAM_KEY", "abcd"),
        ])
        .unwrap();

        assert_eq!(config.endpoint.port(), 554);
        assert_eq!(config.port, 8080);
        assert_eq!(config.supervisor.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.supervisor.policy.max_attempts, 3);
        assert_eq!(config.supervisor.policy.reconnect_delay, Duration::from_secs(10));
        assert!(config.supervisor.policy.fallback_enabled);
        assert_eq!(config.encoding.fps, 30);
        assert_eq!(config.alert_cooldown, Duration::from_secs(300));
        assert!(config.smtp.is_none());
        assert!(matches!(config.output, OutputTarget::Push { .. }));
    }

    #[test]
    fn test_segment_output() {
        let config = load(&[
            ("CAMERA_RTSP_URL", "rtsp://10.0.0.5/live"),
            ("OUTPUT_MODE", "segment"),
            ("HLS_OUTPUT_DIR", "/tmp/hls"),
            ("HLS_SEGMENT_SECONDS", "4"),
        ])
        .unwrap();

        match config.output {
            OutputTarget::Segment(seg) => {
                assert_eq!(seg.dir, PathBuf::from("/tmp/hls"));
                assert_eq!(seg.segment_seconds, 4);
                assert_eq!(seg.list_size, 10);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_missing_and_invalid_values() {
        assert!(matches!(load(&[]), Err(Error::Config(_))));

        let err = load(&[("CAMERA_RTSP_URL", "rtsp://10.0.0.5/live")]).unwrap_err();
        assert!(err.to_string().contains("RTMP_URL"));

        let err = load(&[
            ("CAMERA_RTSP_URL", "rtsp://10.0.0.5/live"),
            ("RTMP_URL", "rtmp://x/app"),
            ("MAX_RECONNECT_ATTEMPTS", "three"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("MAX_RECONNECT_ATTEMPTS"));

        let err = load(&[
            ("CAMERA_RTSP_URL", "rtsp://10.0.0.5/live"),
            ("OUTPUT_MODE", "webrtc"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_smtp_requires_all_fields() {
        let base = [
            ("CAMERA_RTSP_URL", "rtsp://10.0.0.5/live"),
            ("RTMP_URL", "rtmp://x/app"),
            ("SMTP_HOST", "smtp.example.com"),
            ("SMTP_USER", "alerts@example.com"),
            ("SMTP_PASSWORD", "pw"),
        ];
        assert!(load(&base).unwrap().smtp.is_none());

        let mut full = base.to_vec();
        full.push(("ALERT_EMAIL", "ops@example.com"));
        let smtp = load(&full).unwrap().smtp.unwrap();
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.to, "ops@example.com");
    }

    #[test]
    fn test_warnings() {
        let config = load(&[
            ("CAMERA_RTSP_URL", "rtsp://10.0.0.5/live"),
            ("RTMP_URL", "rtmp://x/app"),
            ("STREAM_RESOLUTION", "1080p"),
            ("STREAM_FPS", "120"),
            ("STREAM_BITRATE", "4500"),
            ("ENABLE_FALLBACK", "false"),
        ])
        .unwrap();

        let warnings = config.warnings();
        assert_eq!(warnings.len(), 4);
        assert!(warnings[0].contains("No alert channel"));
    }
}
