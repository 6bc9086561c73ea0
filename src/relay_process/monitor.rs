//! OutputMonitor - relay stderr reader
//!
//! ffmpegのstderrを1行ずつ読み、接続断のマーカーを検出したら
//! ConnectionLostイベントを制御ループへ送る。

use super::types::{RelayEvent, RelayEventKind};
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Phrases (lowercase) that mean the relay lost its source or sink
pub const FAILURE_MARKERS: &[&str] = &[
    "connection failed",
    "broken pipe",
    "connection refused",
    "connection reset",
    "connection timed out",
    "i/o error",
    "server returned 404",
];

/// Returns the matched marker, if any
pub fn match_failure_marker(line: &str) -> Option<&'static str> {
    let lower = line.to_lowercase();
    FAILURE_MARKERS
        .iter()
        .copied()
        .find(|marker| lower.contains(marker))
}

/// Spawn the reader task for one relay run
///
/// `last_activity` holds unix millis of the last line seen. Only the first
/// matched marker raises an event; the reader keeps draining afterwards so
/// the child never blocks on a full pipe. Bytes that are not UTF-8 (camera
/// metadata in legacy encodings) are decoded lossily, never fatal.
pub fn spawn<R>(
    run_id: Uuid,
    output: R,
    events: mpsc::Sender<RelayEvent>,
    last_activity: Arc<AtomicI64>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(output);
        let mut buf = Vec::with_capacity(512);
        let mut reported = false;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(run_id = %run_id, error = %e, "Relay output read error");
                    break;
                }
            }

            last_activity.store(Utc::now().timestamp_millis(), Ordering::Relaxed);

            let decoded = String::from_utf8_lossy(&buf);
            let line = decoded.trim();
            if line.is_empty() {
                continue;
            }

            let lower = line.to_lowercase();
            if lower.contains("error") || lower.contains("failed") || lower.contains("connection") {
                tracing::warn!(run_id = %run_id, "relay: {}", line);
            } else {
                tracing::trace!(run_id = %run_id, "relay: {}", line);
            }

            if reported {
                continue;
            }

            if let Some(marker) = match_failure_marker(line) {
                tracing::error!(run_id = %run_id, marker = marker, "Relay connection lost");
                reported = true;
                let event = RelayEvent {
                    run_id,
                    kind: RelayEventKind::ConnectionLost {
                        line: line.to_string(),
                    },
                };
                if events.send(event).await.is_err() {
                    tracing::debug!(run_id = %run_id, "Event receiver gone");
                }
            }
        }

        tracing::debug!(run_id = %run_id, "Relay output monitor finished");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_markers() {
        assert_eq!(
            match_failure_marker("[tcp @ 0x55] Connection failed: timeout"),
            Some("connection failed")
        );
        assert_eq!(
            match_failure_marker("av_interleaved_write_frame(): Broken pipe"),
            Some("broken pipe")
        );
        assert_eq!(match_failure_marker("frame=  120 fps= 30 q=23.0"), None);
    }

    #[tokio::test]
    async fn test_monitor_reports_first_marker_only() {
        let (tx, mut rx) = mpsc::channel(8);
        let activity = Arc::new(AtomicI64::new(0));
        let run_id = Uuid::new_v4();

        let output: &'static [u8] =
            b"frame=1\nConnection refused\nBroken pipe\nframe=2\n";
        let handle = spawn(run_id, output, tx, activity.clone());
        handle.await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id, run_id);
        assert_eq!(
            event.kind,
            RelayEventKind::ConnectionLost {
                line: "Connection refused".to_string()
            }
        );
        // sender dropped with the task; no second event
        assert!(rx.recv().await.is_none());
        assert!(activity.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_monitor_survives_non_utf8_lines() {
        let (tx, mut rx) = mpsc::channel(8);
        let activity = Arc::new(AtomicI64::new(0));
        let run_id = Uuid::new_v4();

        let output: &'static [u8] = b"Metadata: title \xff\xfe camera\nConnection refused\n";
        spawn(run_id, output, tx, activity).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            RelayEventKind::ConnectionLost {
                line: "Connection refused".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_monitor_reads_final_line_without_newline() {
        let (tx, mut rx) = mpsc::channel(8);
        let output: &'static [u8] = b"frame=1\nrtmp: Broken pipe";
        spawn(Uuid::new_v4(), output, tx, Arc::new(AtomicI64::new(0)))
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
    }
}
