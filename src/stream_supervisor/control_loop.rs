//! Control loop - the only writer of relay, counter and status
//!
//! One task multiplexes:
//! - health-check ticks (relay poll, stall check, policy)
//! - probe results (spawned so a slow ffprobe never blocks commands)
//! - operator commands (oneshot replies)
//! - relay output events (ConnectionLost)
//! - a scheduled reconnect after a failure
//! - shutdown

use super::status::{format_duration, StreamStatusSnapshot};
use super::SupervisorConfig;
use crate::alert_dispatcher::{AlertCategory, AlertDispatcher};
use crate::camera_endpoint::CameraEndpoint;
use crate::camera_status_tracker::{CameraStatusEvent, CameraStatusTracker};
use crate::error::{Error, Result};
use crate::health_probe::{CameraProbe, HealthStatus, HealthVerdict};
use crate::reconnect_policy::{decide, Action, Decision, PolicyInput, ReconnectCounter};
use crate::relay_process::{
    OutputTarget, PollStatus, RelayEvent, RelayEventKind, RelayMode, RelayProcess, RelayState,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub(super) type Reply = oneshot::Sender<Result<StreamStatusSnapshot>>;

/// Operator requests
pub(super) enum Command {
    Start(Reply),
    Stop(Reply),
    Restart(Reply),
}

/// Reconnect waiting out its delay
#[derive(Debug, Clone, Copy)]
struct PendingRestart {
    mode: RelayMode,
    at: Instant,
}

pub(super) struct ControlLoop {
    config: SupervisorConfig,
    endpoint: CameraEndpoint,
    probe: Arc<dyn CameraProbe>,
    relay: RelayProcess,
    alerts: Arc<AlertDispatcher>,
    alert_tasks: TaskTracker,
    tracker: CameraStatusTracker,
    counter: ReconnectCounter,
    verdict: HealthVerdict,
    desired: bool,
    pending: Option<PendingRestart>,
    /// Running without a Degraded transition since
    clean_since: Option<Instant>,
    last_error: Option<String>,
    status_tx: watch::Sender<StreamStatusSnapshot>,
}

impl ControlLoop {
    pub(super) fn new(
        config: SupervisorConfig,
        endpoint: CameraEndpoint,
        probe: Arc<dyn CameraProbe>,
        relay: RelayProcess,
        alerts: Arc<AlertDispatcher>,
        status_tx: watch::Sender<StreamStatusSnapshot>,
    ) -> Self {
        let tracker = CameraStatusTracker::new(endpoint.to_string());
        let desired = config.autostart;
        Self {
            config,
            endpoint,
            probe,
            relay,
            alerts,
            alert_tasks: TaskTracker::new(),
            tracker,
            counter: ReconnectCounter::default(),
            verdict: HealthVerdict::unknown(),
            desired,
            pending: None,
            clean_since: None,
            last_error: None,
            status_tx,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<RelayEvent>,
        cancel: CancellationToken,
    ) {
        tracing::info!(
            camera = %self.endpoint.redacted(),
            target = %self.relay.target().describe(),
            interval_sec = self.config.health_check_interval.as_secs(),
            autostart = self.desired,
            "Stream supervisor started"
        );
        self.alert(AlertCategory::General, "Stream supervisor started");

        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut probing: Option<JoinHandle<HealthVerdict>> = None;

        loop {
            let pending_at = self.pending.map(|p| p.at);

            tokio::select! {
                _ = cancel.cancelled() => break,

                _ = ticker.tick() => {
                    self.tick().await;
                    if probing.is_none() {
                        probing = Some(self.spawn_probe());
                    }
                }

                result = join_probe(&mut probing) => {
                    probing = None;
                    match result {
                        Ok(verdict) => self.on_verdict(verdict).await,
                        Err(e) => tracing::error!(error = %e, "Health probe task failed"),
                    }
                }

                Some(command) = commands.recv() => {
                    let needs_probe = self.handle_command(command).await;
                    if needs_probe && probing.is_none() {
                        probing = Some(self.spawn_probe());
                    }
                }

                Some(event) = events.recv() => self.handle_event(event).await,

                _ = sleep_until(pending_at) => self.fire_pending().await,
            }

            self.publish();
        }

        tracing::info!("Stream supervisor shutting down");
        if let Some(task) = probing.take() {
            task.abort();
        }
        self.pending = None;
        if let Err(e) = self.relay.stop(self.config.stop_grace).await {
            tracing::error!(error = %e, "Relay stop during shutdown failed");
        }
        self.clean_since = None;
        self.publish();

        self.alert_tasks.close();
        if tokio::time::timeout(self.config.stop_grace, self.alert_tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("Pending alerts abandoned at shutdown");
        }
        tracing::info!("Stream supervisor stopped");
    }

    fn spawn_probe(&self) -> JoinHandle<HealthVerdict> {
        let probe = self.probe.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move { probe.evaluate(&endpoint).await })
    }

    /// Periodic relay checks, then the policy on the last known verdict
    async fn tick(&mut self) {
        let mode = self.relay.mode();
        match self.relay.poll().await {
            PollStatus::Exited(exit) => {
                if self.desired {
                    self.handle_failure(mode, Error::ProcessExited(exit.to_string()))
                        .await;
                    return;
                }
            }
            PollStatus::Alive => {
                if let Some(stall) = self.stall_reason() {
                    if self
                        .counter
                        .begin_stall_restart(Instant::now(), &self.config.policy)
                    {
                        self.handle_failure(mode, stall).await;
                        return;
                    }
                    // a stalled run is not clean, so no stabilization either
                    tracing::debug!(reason = %stall, "Output stalled, restart cooling down");
                } else if self.relay.state() == RelayState::Running {
                    if let Some(since) = self.clean_since {
                        self.counter
                            .stabilize(since.elapsed(), &self.config.policy);
                    }
                }
            }
            PollStatus::NotRunning => {}
        }

        self.reconcile().await;
    }

    /// Segment output only: playlist missing or too old after the grace period
    fn stall_reason(&self) -> Option<Error> {
        if !matches!(self.relay.target(), OutputTarget::Segment(_)) {
            return None;
        }
        let uptime = self.relay.handle()?.uptime();
        if uptime < self.config.output_grace {
            return None;
        }
        match self.relay.output_age() {
            Some(age) if age > self.config.stale_output => Some(Error::OutputStalled(format!(
                "playlist not updated for {}",
                format_duration(age.as_secs())
            ))),
            Some(_) => None,
            None => Some(Error::OutputStalled("no playlist written".to_string())),
        }
    }

    async fn on_verdict(&mut self, verdict: HealthVerdict) {
        let event = self.tracker.update(verdict.status);
        let reason = verdict
            .failure
            .as_ref()
            .map(|f| format!("{} check failed: {}", f.layer, f.reason))
            .unwrap_or_default();
        self.verdict = verdict;

        match event {
            Some(CameraStatusEvent::Lost) => {
                self.alert(
                    AlertCategory::CameraOffline,
                    format!("Camera {} is unreachable. {}", self.endpoint, reason),
                );
            }
            Some(CameraStatusEvent::Recovered) => {
                self.counter.on_recovery();
                self.alert(
                    AlertCategory::CameraOnline,
                    format!("Camera {} is reachable again", self.endpoint),
                );
            }
            None => {}
        }

        self.reconcile().await;
    }

    /// Level-triggered policy check when nothing is pending
    async fn reconcile(&mut self) {
        if !self.desired || self.pending.is_some() {
            return;
        }

        let input = PolicyInput {
            relay: self.relay.state(),
            mode: self.relay.mode(),
            health: self.verdict.status,
            now: Instant::now(),
        };
        let decision = decide(&input, self.counter, &self.config.policy);
        if decision.action == Action::None {
            self.counter = decision.counter;
            return;
        }

        tracing::info!(
            action = %decision.action,
            relay_state = %input.relay,
            mode = ?input.mode,
            health = %input.health,
            "Policy decision"
        );

        match (decision.action.target_mode(), decision.delay) {
            (Some(mode), None) => {
                self.counter = decision.counter;
                if let Err(e) = self.launch(mode).await {
                    tracing::debug!(error = %e, "Launch failure handled by policy");
                }
            }
            _ => self.schedule(decision).await,
        }
    }

    /// Relay failed: Degraded, alert, stop what is left, then ask the policy
    async fn handle_failure(&mut self, mode: Option<RelayMode>, reason: Error) {
        self.relay.set_state(RelayState::Degraded);
        self.clean_since = None;
        self.last_error = Some(reason.to_string());
        self.publish();

        tracing::error!(mode = ?mode, error_code = reason.code(), reason = %reason, "Relay degraded");
        self.alert(
            AlertCategory::StreamFailed,
            format!(
                "Relay ({}) failed: {}",
                mode.map(|m| m.as_str()).unwrap_or("none"),
                reason
            ),
        );

        if let Err(e) = self.relay.stop(self.config.stop_grace).await {
            tracing::error!(error = %e, "Failed to stop degraded relay");
        }

        let input = PolicyInput {
            relay: RelayState::Degraded,
            mode,
            health: self.verdict.status,
            now: Instant::now(),
        };
        let decision = decide(&input, self.counter, &self.config.policy);
        self.schedule(decision).await;
    }

    /// Apply a decision without launching directly
    async fn schedule(&mut self, decision: Decision) {
        self.counter = decision.counter;

        match decision.action {
            Action::None => {}
            Action::GiveUp => self.give_up().await,
            action => {
                let Some(mode) = action.target_mode() else {
                    return;
                };
                let delay = decision.delay.unwrap_or_default();
                tracing::info!(
                    mode = %mode,
                    attempt = self.counter.attempts,
                    max_attempts = self.config.policy.max_attempts,
                    delay_sec = delay.as_secs_f64(),
                    "Reconnect scheduled"
                );
                self.pending = Some(PendingRestart {
                    mode,
                    at: Instant::now() + delay,
                });
            }
        }
    }

    async fn fire_pending(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        if !self.desired {
            return;
        }
        if let Err(e) = self.launch(pending.mode).await {
            tracing::debug!(error = %e, "Reconnect attempt failed");
        }
    }

    /// Stop whatever runs, then start `mode`
    ///
    /// A launch failure counts as a Degraded attempt and is scheduled by the policy.
    async fn launch(&mut self, mode: RelayMode) -> Result<()> {
        if self.relay.is_active() {
            self.relay.stop(self.config.stop_grace).await?;
        }

        match self.relay.start(mode).await {
            Ok(run_id) => {
                self.clean_since = Some(Instant::now());
                self.last_error = None;
                tracing::info!(run_id = %run_id, mode = %mode, "Relay running");
                self.alert(
                    AlertCategory::StreamStarted,
                    format!(
                        "Relay started in {} mode, output {}",
                        mode,
                        self.relay.target().describe()
                    ),
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(mode = %mode, error = %e, "Relay launch failed");
                self.last_error = Some(e.to_string());
                self.alert(
                    AlertCategory::StreamFailed,
                    format!("Relay ({}) failed to launch: {}", mode, e),
                );
                let input = PolicyInput {
                    relay: RelayState::Degraded,
                    mode: Some(mode),
                    health: self.verdict.status,
                    now: Instant::now(),
                };
                let decision = decide(&input, self.counter, &self.config.policy);
                self.schedule(decision).await;
                Err(e)
            }
        }
    }

    async fn give_up(&mut self) {
        self.pending = None;
        if let Err(e) = self.relay.stop(self.config.stop_grace).await {
            tracing::error!(error = %e, "Failed to stop relay on give-up");
        }
        self.clean_since = None;

        let message = if self.counter.attempts >= self.config.policy.max_attempts {
            Error::MaxAttemptsExceeded(self.config.policy.max_attempts).to_string()
        } else {
            format!(
                "Camera {} unreachable and fallback disabled",
                self.endpoint
            )
        };
        tracing::error!(reason = %message, "Giving up on relay until recovery or operator action");
        self.last_error = Some(message.clone());
        self.alert(
            AlertCategory::SystemError,
            format!("{}. Waiting for camera recovery or manual restart.", message),
        );
    }

    /// Returns true when a fresh probe is wanted
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start(reply) => {
                tracing::info!("Start requested");
                let result = self.operator_start(false).await;
                let _ = reply.send(result);
                self.verdict.status == HealthStatus::Unknown
            }
            Command::Restart(reply) => {
                tracing::info!("Restart requested");
                let result = self.operator_start(true).await;
                let _ = reply.send(result);
                self.verdict.status == HealthStatus::Unknown
            }
            Command::Stop(reply) => {
                tracing::info!("Stop requested");
                let result = self.operator_stop().await;
                let _ = reply.send(result);
                false
            }
        }
    }

    async fn operator_start(&mut self, restart: bool) -> Result<StreamStatusSnapshot> {
        self.desired = true;
        self.counter.reset();
        self.pending = None;

        if restart {
            self.relay.stop(self.config.stop_grace).await?;
            self.clean_since = None;
        } else if self.relay.is_active() {
            return Ok(self.snapshot());
        }

        let input = PolicyInput {
            relay: RelayState::Stopped,
            mode: None,
            health: self.verdict.status,
            now: Instant::now(),
        };
        let decision = decide(&input, self.counter, &self.config.policy);
        self.counter = decision.counter;

        match decision.action.target_mode() {
            Some(mode) => self.launch(mode).await?,
            None => tracing::info!(
                health = %self.verdict.status,
                "Relay start deferred until the camera state allows it"
            ),
        }

        Ok(self.snapshot())
    }

    async fn operator_stop(&mut self) -> Result<StreamStatusSnapshot> {
        self.desired = false;
        self.pending = None;
        let exit = self.relay.stop(self.config.stop_grace).await?;
        self.clean_since = None;

        if exit.is_some() {
            self.alert(AlertCategory::StreamStopped, "Relay stopped by operator");
        }
        Ok(self.snapshot())
    }

    async fn handle_event(&mut self, event: RelayEvent) {
        let current = self.relay.handle().map(|h| h.run_id());
        if current != Some(event.run_id) {
            tracing::debug!(run_id = %event.run_id, "Ignoring event from a previous relay run");
            return;
        }

        match event.kind {
            RelayEventKind::ConnectionLost { line } => {
                let mode = self.relay.mode();
                self.handle_failure(mode, Error::ConnectionLost(line)).await;
            }
        }
    }

    /// Fire-and-forget so slow channels never stall the loop
    fn alert(&self, category: AlertCategory, message: impl Into<String>) {
        let alerts = self.alerts.clone();
        let message = message.into();
        self.alert_tasks.spawn(async move {
            alerts.notify(category, message).await;
        });
    }

    fn snapshot(&self) -> StreamStatusSnapshot {
        let handle = self.relay.handle();
        let uptime = handle.map(|h| h.uptime().as_secs()).unwrap_or(0);
        let output_fresh = match self.relay.target() {
            OutputTarget::Segment(_) if handle.is_some() => Some(
                self.relay
                    .output_age()
                    .map(|age| age <= self.config.stale_output)
                    .unwrap_or(false),
            ),
            _ => None,
        };

        StreamStatusSnapshot {
            is_streaming: self.relay.state() == RelayState::Running,
            mode: self.relay.mode(),
            relay_state: if self.pending.is_some() {
                RelayState::Degraded
            } else {
                self.relay.state()
            },
            camera_health: self.verdict.status,
            reconnect_attempts: self.counter.attempts,
            uptime: format_duration(uptime),
            relay_uptime_seconds: uptime,
            output_target: self.relay.target().describe(),
            camera: self.endpoint.redacted(),
            desired_running: self.desired,
            gave_up: self.counter.exhausted,
            process_alive: handle.is_some(),
            relay_pid: handle.and_then(|h| h.pid()),
            relay_started_at: handle.map(|h| h.started_at()),
            last_output_at: handle.and_then(|h| h.last_output_activity()),
            last_health_check: self.verdict.checked_at,
            stream_info: self.verdict.stream_info.clone(),
            health_failure: self.verdict.failure.clone(),
            output_fresh,
            reconnect_in_seconds: self
                .pending
                .map(|p| p.at.saturating_duration_since(Instant::now()).as_secs()),
            last_error: self.last_error.clone(),
            updated_at: Utc::now(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }
}

async fn join_probe(
    task: &mut Option<JoinHandle<HealthVerdict>>,
) -> std::result::Result<HealthVerdict, tokio::task::JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
