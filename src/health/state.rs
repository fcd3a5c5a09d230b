//! Dependency health state machine.
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! Roles start unhealthy; the first transition to healthy is what
//! readiness waits for. Counters reset on every transition.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleHealth {
    pub role: String,
    pub state: HealthState,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl RoleHealth {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            state: HealthState::Unhealthy,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    /// Returns the new state when this observation caused a transition.
    pub fn observe_success(&mut self, healthy_threshold: u32) -> Option<HealthState> {
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.last_error = None;
        if self.state == HealthState::Unhealthy && self.consecutive_successes >= healthy_threshold.max(1) {
            self.state = HealthState::Healthy;
            self.consecutive_successes = 0;
            return Some(HealthState::Healthy);
        }
        None
    }

    pub fn observe_failure(&mut self, unhealthy_threshold: u32, error: String) -> Option<HealthState> {
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        self.last_error = Some(error);
        if self.state == HealthState::Healthy && self.consecutive_failures >= unhealthy_threshold.max(1) {
            self.state = HealthState::Unhealthy;
            self.consecutive_failures = 0;
            return Some(HealthState::Unhealthy);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis() {
        let mut role = RoleHealth::new("registry");
        assert_eq!(role.observe_success(2), None);
        assert_eq!(role.observe_success(2), Some(HealthState::Healthy));

        assert_eq!(role.observe_failure(3, "e".into()), None);
        assert_eq!(role.observe_success(2), None);
        assert_eq!(role.observe_failure(3, "e".into()), None);
        assert_eq!(role.observe_failure(3, "e".into()), None);
        assert_eq!(role.observe_failure(3, "e".into()), Some(HealthState::Unhealthy));
        assert_eq!(role.last_error.as_deref(), Some("e"));
    }
}
