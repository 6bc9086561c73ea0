//! camstream - Camera Stream Supervisor
//!
//! Main entry point.

use camstream::{
    alert_dispatcher::{AlertChannel, AlertDispatcher, EmailChannel, TelegramChannel},
    health_probe::{CameraProbe, HealthProbe},
    relay_process::{check_ffmpeg, FfmpegCommand, RelayCommandFactory},
    state::{AppConfig, AppState},
    stream_supervisor::StreamSupervisor,
    web_api,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camstream=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camstream v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!(
        camera = %config.endpoint.redacted(),
        output = %config.output.describe(),
        interval_sec = config.supervisor.health_check_interval.as_secs(),
        max_attempts = config.supervisor.policy.max_attempts,
        fallback = config.supervisor.policy.fallback_enabled,
        telegram = config.telegram_configured(),
        email = config.smtp.is_some(),
        "Configuration loaded"
    );
    for warning in config.warnings() {
        tracing::warn!("Config: {}", warning);
    }

    // ffmpegが無くても起動はする（起動失敗はポリシー側でリトライ扱い）
    match check_ffmpeg(&config.ffmpeg_path).await {
        Ok(version) => tracing::info!(version = %version, "ffmpeg available"),
        Err(e) => tracing::error!(error = %e, "ffmpeg check failed"),
    }

    // Initialize components
    let probe: Arc<dyn CameraProbe> = Arc::new(HealthProbe::new(config.probe.clone()));

    let factory: Arc<dyn RelayCommandFactory> = Arc::new(FfmpegCommand {
        ffmpeg_path: config.ffmpeg_path.clone(),
        source_url: config.camera_url.clone(),
        fallback_image: config.fallback_image.clone(),
        encoding: config.encoding.clone(),
    });

    let channels: Vec<Arc<dyn AlertChannel>> = vec![
        Arc::new(TelegramChannel::new(
            config.telegram_bot_token.clone(),
            config.telegram_chat_id.clone(),
        )),
        Arc::new(EmailChannel::new(config.smtp.clone())),
    ];
    let alerts = Arc::new(AlertDispatcher::new(channels, config.alert_cooldown));

    let supervisor = StreamSupervisor::spawn(
        config.supervisor.clone(),
        config.endpoint.clone(),
        probe.clone(),
        factory,
        config.output.clone(),
        alerts.clone(),
    );

    let state = AppState {
        config: Arc::new(config),
        supervisor: supervisor.clone(),
        probe,
        alerts,
        started_at: chrono::Utc::now(),
    };

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    supervisor.shutdown().await;
    tracing::info!("camstream stopped");

    Ok(())
}

/// Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}
