//! ReconnectPolicy - restart / failover decisions
//!
//! ## Responsibilities
//!
//! - Decide what the supervisor does next from relay state, mode and camera health
//! - Bound retries after relay failures
//! - Space output-stall restarts with a restart cooldown
//!
//! 副作用なしの純粋関数。時刻も入力として受け取るので、テストは時計を動かさずに書ける。

use crate::health_probe::HealthStatus;
use crate::relay_process::{RelayMode, RelayState};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// What the supervisor should do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    None,
    RestartNormal,
    SwitchToFallback,
    SwitchToNormal,
    GiveUp,
}

impl Action {
    /// Mode the relay should run in after this action
    pub fn target_mode(&self) -> Option<RelayMode> {
        match self {
            Action::RestartNormal | Action::SwitchToNormal => Some(RelayMode::Normal),
            Action::SwitchToFallback => Some(RelayMode::Fallback),
            Action::None | Action::GiveUp => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Action::None => "none",
            Action::RestartNormal => "restart_normal",
            Action::SwitchToFallback => "switch_to_fallback",
            Action::SwitchToNormal => "switch_to_normal",
            Action::GiveUp => "give_up",
        };
        f.write_str(s)
    }
}

/// Retry and cooldown tunables
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
    pub fallback_enabled: bool,
    /// Minimum spacing between output-stall restarts
    pub restart_cooldown: Duration,
    /// Clean running time after which the attempt counter resets
    pub stabilization: Duration,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reconnect_delay: Duration::from_secs(10),
            fallback_enabled: true,
            restart_cooldown: Duration::from_secs(300),
            stabilization: Duration::from_secs(60),
        }
    }
}

/// Retry bookkeeping carried between decisions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectCounter {
    /// Restarts since the last stabilization
    pub attempts: u32,
    pub last_restart_at: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    /// Set by GiveUp; blocks automatic restarts
    pub exhausted: bool,
}

impl ReconnectCounter {
    /// Operator Start/Restart: fresh budget
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Camera came back (Unreachable → Reachable)
    pub fn on_recovery(&mut self) {
        if self.exhausted {
            tracing::info!(attempts = self.attempts, "Camera recovered, reconnect budget restored");
        }
        self.attempts = 0;
        self.exhausted = false;
    }

    /// Relay ran cleanly for `clean_for`; returns true when attempts were reset
    pub fn stabilize(&mut self, clean_for: Duration, config: &PolicyConfig) -> bool {
        if self.attempts > 0 && clean_for >= config.stabilization {
            tracing::info!(
                attempts = self.attempts,
                clean_sec = clean_for.as_secs(),
                "Relay stabilized, resetting reconnect attempts"
            );
            self.attempts = 0;
            return true;
        }
        false
    }

    /// Claim a stall-triggered restart; false while the previous one is cooling down
    ///
    /// Camera-health switches and process failures never wait on this.
    pub fn begin_stall_restart(&mut self, now: Instant, config: &PolicyConfig) -> bool {
        if self.in_cooldown(now) {
            return false;
        }
        self.cooldown_until = Some(now + config.restart_cooldown);
        true
    }

    fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }
}

/// Snapshot of the world the decision is made on
#[derive(Debug, Clone, Copy)]
pub struct PolicyInput {
    pub relay: RelayState,
    /// Active mode, None when stopped
    pub mode: Option<RelayMode>,
    pub health: HealthStatus,
    pub now: Instant,
}

/// Result of `decide`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    /// Wait before acting (reconnect delay after a failure)
    pub delay: Option<Duration>,
    pub counter: ReconnectCounter,
}

impl Decision {
    fn none(counter: ReconnectCounter) -> Self {
        Self {
            action: Action::None,
            delay: None,
            counter,
        }
    }
}

/// Decide the next action
///
/// Rules, first match wins:
/// 1. Stopped + Reachable → RestartNormal
/// 2. Stopped + Unreachable + fallback enabled → SwitchToFallback
/// 3. Degraded → restart after `reconnect_delay` while attempts ≤ max, else GiveUp
/// 4. Running Fallback + Reachable → SwitchToNormal
/// 5. Running Normal + Unreachable → SwitchToFallback or GiveUp
///
/// An exhausted counter suppresses rules 1-3.
///
/// On GiveUp from rule 3 the counter keeps `attempts == max_attempts`: the
/// refused attempt is not recorded. A rule 5 GiveUp leaves attempts below the
/// bound, so `attempts >= max_attempts` tells the two reasons apart.
pub fn decide(input: &PolicyInput, counter: ReconnectCounter, config: &PolicyConfig) -> Decision {
    let mut next = counter;
    let unreachable = input.health == HealthStatus::Unreachable;

    match input.relay {
        RelayState::Stopped => {
            if counter.exhausted {
                return Decision::none(counter);
            }
            let action = match input.health {
                HealthStatus::Reachable => Action::RestartNormal,
                HealthStatus::Unreachable if config.fallback_enabled => Action::SwitchToFallback,
                _ => return Decision::none(counter),
            };
            next.last_restart_at = Some(input.now);
            Decision {
                action,
                delay: None,
                counter: next,
            }
        }

        RelayState::Degraded => {
            if counter.exhausted {
                return Decision::none(counter);
            }
            if counter.attempts >= config.max_attempts {
                next.exhausted = true;
                return Decision {
                    action: Action::GiveUp,
                    delay: None,
                    counter: next,
                };
            }
            next.attempts += 1;
            next.last_restart_at = Some(input.now);
            let action = if unreachable && config.fallback_enabled {
                Action::SwitchToFallback
            } else {
                Action::RestartNormal
            };
            Decision {
                action,
                delay: Some(config.reconnect_delay),
                counter: next,
            }
        }

        RelayState::Starting | RelayState::Running => {
            let action = match (input.mode, input.health) {
                (Some(RelayMode::Fallback), HealthStatus::Reachable) => {
                    next.attempts = 0;
                    next.exhausted = false;
                    Action::SwitchToNormal
                }
                (Some(RelayMode::Normal), HealthStatus::Unreachable) if config.fallback_enabled => {
                    Action::SwitchToFallback
                }
                (Some(RelayMode::Normal), HealthStatus::Unreachable) => {
                    next.exhausted = true;
                    Action::GiveUp
                }
                _ => return Decision::none(counter),
            };
            if action != Action::GiveUp {
                next.last_restart_at = Some(input.now);
            }
            Decision {
                action,
                delay: None,
                counter: next,
            }
        }
    }
}
