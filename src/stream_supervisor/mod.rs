//! StreamSupervisor - keeps the camera relay alive
//!
//! ## Responsibilities
//!
//! - Periodic camera health evaluation
//! - Start / stop / restart of the relay according to ReconnectPolicy
//! - Normal ↔ fallback failover
//! - Alerts on health and relay transitions
//! - Status snapshot for the dashboard API
//!
//! ## Design
//!
//! `StreamSupervisor` is a cloneable handle. All mutation happens in one
//! control-loop task; callers talk to it through a command channel and read
//! the latest `StreamStatusSnapshot` from a watch channel without blocking.

mod control_loop;
mod status;

pub use status::{format_duration, StreamStatusSnapshot};

use crate::alert_dispatcher::AlertDispatcher;
use crate::camera_endpoint::CameraEndpoint;
use crate::error::{Error, Result};
use crate::health_probe::CameraProbe;
use crate::reconnect_policy::PolicyConfig;
use crate::relay_process::{OutputTarget, RelayCommandFactory, RelayProcess, DEFAULT_STARTUP_CHECK};
use control_loop::{Command, ControlLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 32;

/// Control loop tunables
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_check_interval: Duration,
    pub stop_grace: Duration,
    /// Segment output older than this marks the relay stalled
    pub stale_output: Duration,
    /// No stall checks for this long after a launch
    pub output_grace: Duration,
    /// Immediate-exit detection window after spawning the relay
    pub startup_check: Duration,
    /// Want the relay running from boot
    pub autostart: bool,
    pub policy: PolicyConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            stop_grace: Duration::from_secs(10),
            stale_output: Duration::from_secs(90),
            output_grace: Duration::from_secs(30),
            startup_check: DEFAULT_STARTUP_CHECK,
            autostart: true,
            policy: PolicyConfig::default(),
        }
    }
}

/// Cloneable handle to the running supervisor
#[derive(Clone)]
pub struct StreamSupervisor {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<StreamStatusSnapshot>,
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl StreamSupervisor {
    /// Build the relay and spawn the control loop
    pub fn spawn(
        config: SupervisorConfig,
        endpoint: CameraEndpoint,
        probe: Arc<dyn CameraProbe>,
        factory: Arc<dyn RelayCommandFactory>,
        target: OutputTarget,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, status_rx) = watch::channel(StreamStatusSnapshot::initial(
            endpoint.redacted(),
            target.describe(),
        ));
        let cancel = CancellationToken::new();

        let relay =
            RelayProcess::new(factory, target, event_tx).with_startup_check(config.startup_check);
        let control = ControlLoop::new(config, endpoint, probe, relay, alerts, status_tx);
        let task = tokio::spawn(control.run(command_rx, event_rx, cancel.clone()));

        Self {
            commands: command_tx,
            status: status_rx,
            cancel,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Latest snapshot; no I/O, never waits on the loop
    pub fn status(&self) -> StreamStatusSnapshot {
        self.status.borrow().clone()
    }

    pub async fn start(&self) -> Result<StreamStatusSnapshot> {
        self.request(Command::Start).await
    }

    pub async fn stop(&self) -> Result<StreamStatusSnapshot> {
        self.request(Command::Stop).await
    }

    pub async fn restart(&self) -> Result<StreamStatusSnapshot> {
        self.request(Command::Restart).await
    }

    /// Cancel the loop, stop the relay and wait for everything to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Control loop task failed");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn request(&self, command: impl FnOnce(control_loop::Reply) -> Command) -> Result<StreamStatusSnapshot> {
        if self.cancel.is_cancelled() {
            return Err(Error::SupervisorUnavailable("supervisor is shut down".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| Error::SupervisorUnavailable("control loop stopped".to_string()))?;
        rx.await
            .map_err(|_| Error::SupervisorUnavailable("control loop dropped the request".to_string()))?
    }
}
