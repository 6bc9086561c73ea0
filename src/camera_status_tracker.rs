//! Camera Status Tracker
//!
//! Tracks the camera's health status to detect lost/recovered transitions.
//! Only transitions raise events so alerts are not sent on every probe.

use crate::health_probe::HealthStatus;
use serde::{Deserialize, Serialize};

/// Camera status transition event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraStatusEvent {
    /// Camera went from Reachable (or Unknown) to Unreachable
    Lost,
    /// Camera went from Unreachable to Reachable
    Recovered,
}

/// Remembers the last verdict status and detects transitions
#[derive(Debug)]
pub struct CameraStatusTracker {
    camera: String,
    status: HealthStatus,
}

impl CameraStatusTracker {
    /// `camera` is the redacted host label used in logs
    pub fn new(camera: impl Into<String>) -> Self {
        Self {
            camera: camera.into(),
            status: HealthStatus::Unknown,
        }
    }

    /// Update status and return transition event if any
    ///
    /// Returns:
    /// - `Some(Lost)` for Reachable → Unreachable
    /// - `Some(Lost)` for Unknown → Unreachable (first probe failed)
    /// - `Some(Recovered)` for Unreachable → Reachable
    /// - `None` otherwise, including Unknown → Reachable
    pub fn update(&mut self, status: HealthStatus) -> Option<CameraStatusEvent> {
        let prev = std::mem::replace(&mut self.status, status);

        match (prev, status) {
            (HealthStatus::Reachable, HealthStatus::Unreachable) => {
                tracing::warn!(camera = %self.camera, "Camera connection lost");
                Some(CameraStatusEvent::Lost)
            }
            (HealthStatus::Unreachable, HealthStatus::Reachable) => {
                tracing::info!(camera = %self.camera, "Camera connection recovered");
                Some(CameraStatusEvent::Recovered)
            }
            (HealthStatus::Unknown, HealthStatus::Unreachable) => {
                tracing::warn!(
                    camera = %self.camera,
                    "Camera initial probe failed - marking as lost"
                );
                Some(CameraStatusEvent::Lost)
            }
            // 初回成功・同一状態はイベントなし
            _ => None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_reachable_no_event() {
        let mut tracker = CameraStatusTracker::new("cam1");
        assert!(tracker.update(HealthStatus::Reachable).is_none());
        assert_eq!(tracker.status(), HealthStatus::Reachable);
    }

    #[test]
    fn test_initial_unreachable_triggers_lost() {
        let mut tracker = CameraStatusTracker::new("cam1");
        assert_eq!(
            tracker.update(HealthStatus::Unreachable),
            Some(CameraStatusEvent::Lost)
        );
    }

    #[test]
    fn test_reachable_to_unreachable_triggers_lost() {
        let mut tracker = CameraStatusTracker::new("cam1");
        tracker.update(HealthStatus::Reachable);
        assert_eq!(
            tracker.update(HealthStatus::Unreachable),
            Some(CameraStatusEvent::Lost)
        );
    }

    #[test]
    fn test_unreachable_to_reachable_triggers_recovered() {
        let mut tracker = CameraStatusTracker::new("cam1");
        tracker.update(HealthStatus::Unreachable);
        assert_eq!(
            tracker.update(HealthStatus::Reachable),
            Some(CameraStatusEvent::Recovered)
        );
    }

    #[test]
    fn test_same_status_no_event() {
        let mut tracker = CameraStatusTracker::new("cam1");
        tracker.update(HealthStatus::Unreachable);
        assert!(tracker.update(HealthStatus::Unreachable).is_none());
        tracker.update(HealthStatus::Reachable);
        assert!(tracker.update(HealthStatus::Reachable).is_none());
    }
}
