//! AlertDispatcher - operator notifications
//!
//! ## Responsibilities
//!
//! - Fan out one alert to every configured channel concurrently
//! - Per-category cooldown so a flapping camera does not flood operators
//! - Keep channel failures away from the caller
//!
//! ## Cooldown
//!
//! The category timestamp only moves when at least one channel delivered.
//! A fully failed alert can be retried on the next call.

mod channels;

pub use channels::{EmailChannel, SmtpConfig, TelegramChannel, TELEGRAM_API_BASE};

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Default window during which a repeated category is dropped
pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(300);

/// Alert category; cooldown is tracked per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    CameraOffline,
    CameraOnline,
    StreamFailed,
    StreamStarted,
    StreamStopped,
    SystemError,
    General,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::CameraOffline => "camera_offline",
            AlertCategory::CameraOnline => "camera_online",
            AlertCategory::StreamFailed => "stream_failed",
            AlertCategory::StreamStarted => "stream_started",
            AlertCategory::StreamStopped => "stream_stopped",
            AlertCategory::SystemError => "system_error",
            AlertCategory::General => "general",
        }
    }

    /// Headline used in the notification body and email subject
    pub fn title(&self) -> &'static str {
        match self {
            AlertCategory::CameraOffline => "Camera Offline",
            AlertCategory::CameraOnline => "Camera Online",
            AlertCategory::StreamFailed => "Stream Failed",
            AlertCategory::StreamStarted => "Stream Started",
            AlertCategory::StreamStopped => "Stream Stopped",
            AlertCategory::SystemError => "System Error",
            AlertCategory::General => "Notice",
        }
    }
}

impl std::fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification to deliver
#[derive(Debug, Clone)]
pub struct Alert {
    pub category: AlertCategory,
    pub message: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Alert {
    pub fn new(category: AlertCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Plain text body: timestamp, headline, message
    pub fn body(&self) -> String {
        format!(
            "[{}] {}\n{}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.category.title(),
            self.message
        )
    }
}

/// One notification transport
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Unconfigured channels are skipped, not failed
    fn is_configured(&self) -> bool;

    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Per-channel result of one dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Sent,
    NotConfigured,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    pub channel: &'static str,
    #[serde(flatten)]
    pub outcome: ChannelOutcome,
}

/// What happened to a `notify` call
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub category: AlertCategory,
    /// Dropped because the category is cooling down
    pub suppressed: bool,
    /// At least one channel delivered
    pub delivered: bool,
    pub channels: Vec<ChannelResult>,
}

/// Fans alerts out to channels with per-category cooldown
pub struct AlertDispatcher {
    channels: Vec<Arc<dyn AlertChannel>>,
    cooldown: Duration,
    last_sent: Mutex<HashMap<AlertCategory, Instant>>,
}

impl AlertDispatcher {
    pub fn new(channels: Vec<Arc<dyn AlertChannel>>, cooldown: Duration) -> Self {
        Self {
            channels,
            cooldown,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Names of channels that have credentials
    pub fn configured_channels(&self) -> Vec<&'static str> {
        self.channels
            .iter()
            .filter(|c| c.is_configured())
            .map(|c| c.name())
            .collect()
    }

    /// Whether `category` would be suppressed right now
    pub fn in_cooldown(&self, category: AlertCategory) -> bool {
        self.cooling(&self.lock_last_sent(), category, Instant::now())
    }

    fn cooling(
        &self,
        last_sent: &HashMap<AlertCategory, Instant>,
        category: AlertCategory,
        now: Instant,
    ) -> bool {
        last_sent
            .get(&category)
            .map(|sent| now.duration_since(*sent) < self.cooldown)
            .unwrap_or(false)
    }

    /// Check and claim the category slot in one step
    ///
    /// Returns the previous timestamp so a fully failed round can hand the
    /// slot back; `Err(())` means the category is cooling down or in flight.
    fn reserve(&self, category: AlertCategory) -> std::result::Result<Option<Instant>, ()> {
        let now = Instant::now();
        let mut last_sent = self.lock_last_sent();
        if self.cooling(&last_sent, category, now) {
            return Err(());
        }
        Ok(last_sent.insert(category, now))
    }

    fn release(&self, category: AlertCategory, previous: Option<Instant>) {
        let mut last_sent = self.lock_last_sent();
        match previous {
            Some(at) => {
                last_sent.insert(category, at);
            }
            None => {
                last_sent.remove(&category);
            }
        }
    }

    /// Send an alert unless its category is cooling down
    ///
    /// Never fails; per-channel errors are logged and reported in the outcome.
    pub async fn notify(&self, category: AlertCategory, message: impl Into<String>) -> DispatchOutcome {
        let alert = Alert::new(category, message);

        let Ok(previous) = self.reserve(category) else {
            tracing::debug!(category = %category, "Alert suppressed by cooldown");
            return DispatchOutcome {
                category,
                suppressed: true,
                delivered: false,
                channels: Vec::new(),
            };
        };

        tracing::info!(category = %category, message = %alert.message, "Dispatching alert");

        let channels = self.fan_out(&alert).await;
        let delivered = channels.iter().any(|r| r.outcome == ChannelOutcome::Sent);

        if !delivered {
            self.release(category, previous);
            if channels.iter().all(|r| r.outcome == ChannelOutcome::NotConfigured) {
                tracing::debug!(category = %category, "No alert channel configured, logged only");
            } else {
                tracing::warn!(category = %category, "Alert delivery failed on every channel");
            }
        }

        DispatchOutcome {
            category,
            suppressed: false,
            delivered,
            channels,
        }
    }

    /// Send a test message through every channel, ignoring cooldown
    pub async fn test_channels(&self) -> Vec<ChannelResult> {
        let alert = Alert::new(
            AlertCategory::General,
            "Test alert from camstream. If you can read this, alerts are working.",
        );
        self.fan_out(&alert).await
    }

    async fn fan_out(&self, alert: &Alert) -> Vec<ChannelResult> {
        let sends = self.channels.iter().map(|channel| async move {
            let outcome = if !channel.is_configured() {
                ChannelOutcome::NotConfigured
            } else {
                match channel.send(alert).await {
                    Ok(()) => {
                        tracing::debug!(channel = channel.name(), category = %alert.category, "Alert sent");
                        ChannelOutcome::Sent
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel = channel.name(),
                            category = %alert.category,
                            error = %e,
                            "Alert channel failed"
                        );
                        ChannelOutcome::Failed(e.to_string())
                    }
                }
            };
            ChannelResult {
                channel: channel.name(),
                outcome,
            }
        });

        futures::future::join_all(sends).await
    }

    fn lock_last_sent(&self) -> std::sync::MutexGuard<'_, HashMap<AlertCategory, Instant>> {
        // 中毒しても記録はただのタイムスタンプなので使い続ける
        self.last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
