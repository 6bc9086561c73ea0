//! RelayProcess - single external video relay
//!
//! ## Responsibilities
//!
//! - Launch the relay for a mode (normal / fallback) and output target
//! - Graceful stop with forced kill after a grace period
//! - Non-blocking liveness poll
//! - Output monitoring (ConnectionLost events)
//! - Stale HLS segment cleanup
//!
//! ## Invariant
//!
//! At most one handle exists. A different mode can only start after `stop`.

mod command;
pub mod monitor;
mod types;

pub use command::{check_ffmpeg, EncodingConfig, FfmpegCommand, RelayCommandFactory};
pub use types::{
    ExitInfo, OutputTarget, PollStatus, RelayEvent, RelayEventKind, RelayMode, RelayState,
    SegmentOutput,
};

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long `start` watches a fresh process for an immediate exit
pub const DEFAULT_STARTUP_CHECK: Duration = Duration::from_secs(1);

/// Bound for joining the output monitor after the process is gone
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Owned state of one running relay
pub struct RelayProcessHandle {
    run_id: Uuid,
    mode: RelayMode,
    state: RelayState,
    child: Child,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    last_activity: Arc<AtomicI64>,
    monitor: Option<JoinHandle<()>>,
}

impl RelayProcessHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Last time the relay wrote diagnostic output
    pub fn last_output_activity(&self) -> Option<DateTime<Utc>> {
        match self.last_activity.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }
}

/// Wraps the single relay invocation
pub struct RelayProcess {
    factory: Arc<dyn RelayCommandFactory>,
    target: OutputTarget,
    events: mpsc::Sender<RelayEvent>,
    startup_check: Duration,
    handle: Option<RelayProcessHandle>,
}

impl RelayProcess {
    /// `events` receives ConnectionLost notifications from every run
    pub fn new(
        factory: Arc<dyn RelayCommandFactory>,
        target: OutputTarget,
        events: mpsc::Sender<RelayEvent>,
    ) -> Self {
        Self {
            factory,
            target,
            events,
            startup_check: DEFAULT_STARTUP_CHECK,
            handle: None,
        }
    }

    /// Override the immediate-exit detection window
    pub fn with_startup_check(mut self, window: Duration) -> Self {
        self.startup_check = window;
        self
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    pub fn handle(&self) -> Option<&RelayProcessHandle> {
        self.handle.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_some()
    }

    pub fn mode(&self) -> Option<RelayMode> {
        self.handle.as_ref().map(|h| h.mode)
    }

    pub fn state(&self) -> RelayState {
        self.handle
            .as_ref()
            .map(|h| h.state)
            .unwrap_or(RelayState::Stopped)
    }

    /// Only meaningful while a handle exists
    pub fn set_state(&mut self, state: RelayState) {
        if let Some(handle) = self.handle.as_mut() {
            if handle.state != state {
                tracing::debug!(
                    run_id = %handle.run_id,
                    from = %handle.state,
                    to = %state,
                    "Relay state change"
                );
            }
            handle.state = state;
        }
    }

    /// Launch the relay
    ///
    /// Same mode already active: no-op. Other mode active: Conflict.
    /// A process that dies inside the startup window is a launch failure.
    pub async fn start(&mut self, mode: RelayMode) -> Result<Uuid> {
        if let Some(handle) = self.handle.as_ref() {
            if handle.mode == mode {
                tracing::warn!(mode = %mode, "Relay already running");
                return Ok(handle.run_id);
            }
            return Err(Error::Conflict(format!(
                "{} relay is active; stop it before starting {}",
                handle.mode, mode
            )));
        }

        self.cleanup_output().await;

        let run_id = Uuid::new_v4();
        let mut cmd = self.factory.build(mode, &self.target);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessLaunch(format!("relay spawn failed: {}", e)))?;
        let pid = child.id();

        let last_activity = Arc::new(AtomicI64::new(0));
        let monitor = child
            .stderr
            .take()
            .map(|stderr| monitor::spawn(run_id, stderr, self.events.clone(), last_activity.clone()));

        tracing::info!(
            run_id = %run_id,
            mode = %mode,
            pid = ?pid,
            target = %self.target.describe(),
            "Relay process launched"
        );

        self.handle = Some(RelayProcessHandle {
            run_id,
            mode,
            state: RelayState::Starting,
            child,
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            last_activity,
            monitor,
        });

        // 起動直後に落ちるのは引数不正などの起動失敗として扱う
        tokio::time::sleep(self.startup_check).await;
        if let PollStatus::Exited(exit) = self.poll().await {
            return Err(Error::ProcessLaunch(format!(
                "relay exited during startup: {}",
                exit
            )));
        }

        self.set_state(RelayState::Running);
        Ok(run_id)
    }

    /// Non-blocking liveness check; an exited process destroys the handle
    pub async fn poll(&mut self) -> PollStatus {
        let Some(handle) = self.handle.as_mut() else {
            return PollStatus::NotRunning;
        };

        let exit = match handle.child.try_wait() {
            Ok(None) => return PollStatus::Alive,
            Ok(Some(status)) => ExitInfo::from_status(status, false),
            Err(e) => {
                tracing::error!(run_id = %handle.run_id, error = %e, "Relay poll failed, killing");
                let _ = handle.child.start_kill();
                match handle.child.wait().await {
                    Ok(status) => ExitInfo::from_status(status, true),
                    Err(_) => ExitInfo {
                        code: None,
                        success: false,
                        forced: true,
                    },
                }
            }
        };

        if let Some(handle) = self.handle.take() {
            tracing::warn!(
                run_id = %handle.run_id,
                mode = %handle.mode,
                exit = %exit,
                "Relay process exited"
            );
            Self::join_monitor(handle).await;
        }
        self.cleanup_output().await;

        PollStatus::Exited(exit)
    }

    /// Graceful stop, then force-kill after `grace`
    ///
    /// Idempotent: returns Ok(None) when nothing is running. Always waits for
    /// the process to exit and the monitor to finish.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<ExitInfo>> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(None);
        };

        tracing::info!(run_id = %handle.run_id, mode = %handle.mode, "Stopping relay");

        let exit = match handle.child.try_wait()? {
            Some(status) => ExitInfo::from_status(status, false),
            None => {
                request_terminate(&mut handle.child);
                match tokio::time::timeout(grace, handle.child.wait()).await {
                    Ok(status) => ExitInfo::from_status(status?, false),
                    Err(_) => {
                        tracing::warn!(
                            run_id = %handle.run_id,
                            grace_sec = grace.as_secs(),
                            "Relay did not exit gracefully, killing"
                        );
                        handle.child.start_kill()?;
                        let status = handle.child.wait().await?;
                        ExitInfo::from_status(status, true)
                    }
                }
            }
        };

        tracing::info!(run_id = %handle.run_id, exit = %exit, "Relay stopped");
        Self::join_monitor(handle).await;
        self.cleanup_output().await;

        Ok(Some(exit))
    }

    /// Immediate forced kill
    pub async fn kill(&mut self) -> Result<Option<ExitInfo>> {
        self.stop(Duration::ZERO).await
    }

    /// Age of the HLS playlist; None for push targets or missing playlist
    pub fn output_age(&self) -> Option<Duration> {
        let OutputTarget::Segment(seg) = &self.target else {
            return None;
        };
        let modified = std::fs::metadata(seg.playlist_path()).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }

    async fn join_monitor(mut handle: RelayProcessHandle) {
        if let Some(monitor) = handle.monitor.take() {
            let abort = monitor.abort_handle();
            if tokio::time::timeout(MONITOR_JOIN_TIMEOUT, monitor).await.is_err() {
                // 子プロセスの孫がstderrを握っている場合
                tracing::warn!(run_id = %handle.run_id, "Output monitor did not finish, aborting");
                abort.abort();
            }
        }
    }

    /// Remove stale playlist/segments so nobody serves old media
    async fn cleanup_output(&self) {
        let OutputTarget::Segment(seg) = &self.target else {
            return;
        };

        if let Err(e) = tokio::fs::create_dir_all(&seg.dir).await {
            tracing::warn!(dir = %seg.dir.display(), error = %e, "Cannot create segment directory");
            return;
        }

        let mut entries = match tokio::fs::read_dir(&seg.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %seg.dir.display(), error = %e, "Cannot list segment directory");
                return;
            }
        };

        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_media = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("ts") | Some("m3u8") | Some("tmp")
            );
            if is_media && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!(dir = %seg.dir.display(), removed = removed, "Stale segment files removed");
        }
    }
}

/// SIGTERM on unix; elsewhere there is no graceful signal, so kill
fn request_terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we own and have not reaped yet
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc == 0 {
                return;
            }
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    /// Runs `sh -c <script>` per mode instead of ffmpeg
    struct ScriptFactory {
        normal: &'static str,
        fallback: &'static str,
    }

    impl RelayCommandFactory for ScriptFactory {
        fn build(&self, mode: RelayMode, _target: &OutputTarget) -> Command {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(match mode {
                RelayMode::Normal => self.normal,
                RelayMode::Fallback => self.fallback,
            });
            cmd
        }
    }

    fn push_target() -> OutputTarget {
        OutputTarget::Push {
            url: "rtmp://localhost/live".to_string(),
            stream_key: "test".to_string(),
        }
    }

    fn relay(normal: &'static str, fallback: &'static str) -> (RelayProcess, mpsc::Receiver<RelayEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let relay = RelayProcess::new(Arc::new(ScriptFactory { normal, fallback }), push_target(), tx)
            .with_startup_check(Duration::from_millis(100));
        (relay, rx)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (mut relay, _rx) = relay("exec sleep 30", "exec sleep 30");

        relay.start(RelayMode::Normal).await.unwrap();
        assert_eq!(relay.state(), RelayState::Running);
        assert_eq!(relay.mode(), Some(RelayMode::Normal));
        assert_eq!(relay.poll().await, PollStatus::Alive);

        let exit = relay.stop(Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(!exit.forced);
        assert!(!relay.is_active());
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut relay, _rx) = relay("exec sleep 30", "exec sleep 30");
        assert!(relay.stop(Duration::from_secs(1)).await.unwrap().is_none());

        relay.start(RelayMode::Normal).await.unwrap();
        assert!(relay.stop(Duration::from_secs(5)).await.unwrap().is_some());
        assert!(relay.stop(Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_mode_start_is_noop_other_mode_conflicts() {
        let (mut relay, _rx) = relay("exec sleep 30", "exec sleep 30");

        let first = relay.start(RelayMode::Normal).await.unwrap();
        let again = relay.start(RelayMode::Normal).await.unwrap();
        assert_eq!(first, again);

        let err = relay.start(RelayMode::Fallback).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(relay.mode(), Some(RelayMode::Normal));

        relay.stop(Duration::from_secs(5)).await.unwrap();
        relay.start(RelayMode::Fallback).await.unwrap();
        assert_eq!(relay.mode(), Some(RelayMode::Fallback));
        relay.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_ignored_sigterm_is_force_killed() {
        let (mut relay, _rx) = relay("trap '' TERM; while true; do sleep 1; done", "exec sleep 30");

        relay.start(RelayMode::Normal).await.unwrap();
        let exit = relay.stop(Duration::from_millis(300)).await.unwrap().unwrap();
        assert!(exit.forced);
        assert!(!relay.is_active());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_launch_failure() {
        let (mut relay, _rx) = relay("exit 3", "exec sleep 30");

        let err = relay.start(RelayMode::Normal).await.unwrap_err();
        assert!(matches!(err, Error::ProcessLaunch(_)));
        assert!(!relay.is_active());
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_failure() {
        struct Missing;
        impl RelayCommandFactory for Missing {
            fn build(&self, _mode: RelayMode, _target: &OutputTarget) -> Command {
                Command::new("/nonexistent/relay-binary")
            }
        }

        let (tx, _rx) = mpsc::channel(8);
        let mut relay = RelayProcess::new(Arc::new(Missing), push_target(), tx);
        let err = relay.start(RelayMode::Normal).await.unwrap_err();
        assert!(matches!(err, Error::ProcessLaunch(_)));
        assert!(!relay.is_active());
    }

    #[tokio::test]
    async fn test_poll_reports_exit() {
        let (mut relay, _rx) = relay("sleep 0.3; exit 1", "exec sleep 30");

        relay.start(RelayMode::Normal).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        match relay.poll().await {
            PollStatus::Exited(exit) => {
                assert_eq!(exit.code, Some(1));
                assert!(!exit.success);
            }
            other => panic!("expected exit, got {:?}", other),
        }
        assert_eq!(relay.poll().await, PollStatus::NotRunning);
    }

    #[tokio::test]
    async fn test_connection_lost_event() {
        let (mut relay, mut rx) = relay(
            "echo 'rtsp://cam: Connection failed' >&2; exec sleep 30",
            "exec sleep 30",
        );

        let run_id = relay.start(RelayMode::Normal).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(event.run_id, run_id);
        assert!(matches!(event.kind, RelayEventKind::ConnectionLost { .. }));
        assert!(relay.handle().unwrap().last_output_activity().is_some());

        relay.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_segment_files_cleaned_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let seg = SegmentOutput {
            dir: dir.path().to_path_buf(),
            segment_seconds: 3,
            list_size: 10,
        };
        std::fs::write(seg.playlist_path(), "#EXTM3U\n").unwrap();
        std::fs::write(dir.path().join("segment_001.ts"), b"old").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"unrelated").unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let mut relay = RelayProcess::new(
            Arc::new(ScriptFactory {
                normal: "exec sleep 30",
                fallback: "exec sleep 30",
            }),
            OutputTarget::Segment(seg.clone()),
            tx,
        )
        .with_startup_check(Duration::from_millis(50));

        // start clears stale media from a previous run
        relay.start(RelayMode::Normal).await.unwrap();
        assert!(!seg.playlist_path().exists());
        assert!(relay.output_age().is_none());

        std::fs::write(seg.playlist_path(), "#EXTM3U\n").unwrap();
        assert!(relay.output_age().is_some());

        relay.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!seg.playlist_path().exists());
        assert!(dir.path().join("keep.txt").exists());
    }
}
