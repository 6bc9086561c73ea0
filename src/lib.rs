//! camstream - Camera Stream Supervisor
//!
//! Keeps a video relay (ffmpeg) alive against an unreliable RTSP camera,
//! failing over to a static fallback feed and alerting operators.
//!
//! ## Architecture (leaves first)
//!
//! 1. HealthProbe - layered camera reachability (ping / TCP / RTSP)
//! 2. RelayProcess - the single relay process and its output monitor
//! 3. ReconnectPolicy - pure restart / failover decisions
//! 4. AlertDispatcher - Telegram / email fan-out with cooldown
//! 5. StreamSupervisor - control loop tying 1-4 together
//! 6. WebAPI - status and control endpoints
//!
//! ## Design Principles
//!
//! - Single writer: only the control loop touches the relay
//! - Normal and fallback relays never run concurrently
//! - Output freshness and camera health are separate signals

pub mod alert_dispatcher;
pub mod camera_endpoint;
pub mod camera_status_tracker;
pub mod error;
pub mod health_probe;
pub mod models;
pub mod reconnect_policy;
pub mod relay_process;
pub mod state;
pub mod stream_supervisor;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
