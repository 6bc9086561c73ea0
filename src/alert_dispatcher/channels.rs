//! Alert channels: Telegram bot API and SMTP email

use super::{Alert, AlertChannel};
use crate::error::{Error, Result};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Telegram `sendMessage` via a bot token
pub struct TelegramChannel {
    client: reqwest::Client,
    api_base: String,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl TelegramChannel {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        Self::with_api_base(TELEGRAM_API_BASE, bot_token, chat_id)
    }

    /// Point at a different API host (tests, proxies)
    pub fn with_api_base(
        api_base: impl Into<String>,
        bot_token: Option<String>,
        chat_id: Option<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.filter(|t| !t.is_empty()),
            chat_id: chat_id.filter(|c| !c.is_empty()),
        }
    }

    fn failure(message: impl Into<String>) -> Error {
        Error::AlertChannel {
            channel: "telegram".to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.chat_id.is_some()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            return Err(Self::failure("bot token or chat id not configured"));
        };

        let url = format!("{}/bot{}/sendMessage", self.api_base, token);
        let payload = json!({
            "chat_id": chat_id,
            "text": escape_html(&alert.body()),
            "parse_mode": "HTML",
        });

        // reqwestのエラー文字列はURL(トークン入り)を含むので使わない
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Self::failure("request timed out")
                } else {
                    Self::failure("request failed")
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::failure(format!("HTTP {}: {}", status, body.trim())));
        }

        Ok(())
    }
}

/// Escape the characters Telegram's HTML parse mode treats specially
fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// SMTP account and recipient
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Recipient address
    pub to: String,
}

/// Email through an SMTP relay (STARTTLS, or implicit TLS on 465)
pub struct EmailChannel {
    config: Option<SmtpConfig>,
}

impl EmailChannel {
    pub fn new(config: Option<SmtpConfig>) -> Self {
        Self { config }
    }

    fn failure(message: impl Into<String>) -> Error {
        Error::AlertChannel {
            channel: "email".to_string(),
            message: message.into(),
        }
    }

    fn transport(config: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let creds = Credentials::new(config.username.clone(), config.password.clone());

        let builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| Self::failure(format!("SMTP transport setup failed: {}", e)))?;

        Ok(builder
            .credentials(creds)
            .port(config.port)
            .timeout(Some(SEND_TIMEOUT))
            .build())
    }
}

#[async_trait]
impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let Some(config) = &self.config else {
            return Err(Self::failure("SMTP not configured"));
        };

        let from: Mailbox = config
            .username
            .parse()
            .map_err(|e| Self::failure(format!("invalid sender address: {}", e)))?;
        let to: Mailbox = config
            .to
            .parse()
            .map_err(|e| Self::failure(format!("invalid recipient address: {}", e)))?;

        let email = Message::builder()
            .from(from)
            .to(to)
            .subject(format!("Camera Alert: {}", alert.category.title()))
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body())
            .map_err(|e| Self::failure(format!("failed to build email: {}", e)))?;

        Self::transport(config)?
            .send(email)
            .await
            .map_err(|e| Self::failure(format!("SMTP send failed: {}", e)))?;

        tracing::debug!(host = %config.host, port = config.port, "Alert email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert_dispatcher::AlertCategory;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_telegram_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "42", "parse_mode": "HTML"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let channel = TelegramChannel::with_api_base(
            server.uri(),
            Some("123:abc".to_string()),
            Some("42".to_string()),
        );
        assert!(channel.is_configured());

        let alert = Alert::new(AlertCategory::CameraOffline, "camera <10.0.0.5> down");
        channel.send(&alert).await.unwrap();
    }

    #[tokio::test]
    async fn test_telegram_error_status_hides_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Unauthorized"))
            .mount(&server)
            .await;

        let channel = TelegramChannel::with_api_base(
            server.uri(),
            Some("secret-token".to_string()),
            Some("42".to_string()),
        );
        let err = channel
            .send(&Alert::new(AlertCategory::General, "x"))
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("401"));
        assert!(!msg.contains("secret-token"));
    }

    #[test]
    fn test_unconfigured_channels() {
        assert!(!TelegramChannel::new(Some("t".to_string()), None).is_configured());
        assert!(!TelegramChannel::new(Some(String::new()), Some("1".to_string())).is_configured());
        assert!(!EmailChannel::new(None).is_configured());
    }

    #[tokio::test]
    async fn test_email_to_closed_port_fails() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let channel = EmailChannel::new(Some(SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: "alerts@example.com".to_string(),
            password: "pw".to_string(),
            to: "ops@example.com".to_string(),
        }));

        let err = channel
            .send(&Alert::new(AlertCategory::SystemError, "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlertChannel { .. }));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("a<b>&c"), "a&lt;b&gt;&amp;c");
    }
}
