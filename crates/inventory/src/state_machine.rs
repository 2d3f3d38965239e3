//! The device lifecycle transition function.
//!
//! Pool machinery owns the assignment states; the inventory loop never
//! enters or leaves them. `NoPoolMatched` is terminal.

use gpu_api::device::DeviceState;

/// Node-level signals feeding the transition function. The per-device
/// health flag is folded in by the device service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    /// The node finished bootstrapping (its `Ready` condition is true).
    pub bootstrapped: bool,
    /// GPU infrastructure on the node is serving (feature discovery ran).
    pub infra_ready: bool,
    /// GPU infrastructure is present but degraded.
    pub infra_degraded: bool,
    /// The device carries a recorded health error.
    pub health_error: bool,
}

impl Observation {
    pub fn with_health(self, health_error: bool) -> Self {
        Observation {
            health_error,
            ..self
        }
    }
}

/// Returns the state the device should be in and whether that is a change.
/// Total over every `(current, observation)` combination.
pub fn desired_state(current: DeviceState, obs: Observation) -> (DeviceState, bool) {
    let desired = transition(current, obs);
    (desired, desired != current)
}

fn transition(current: DeviceState, obs: Observation) -> DeviceState {
    if current.is_assignment() || current == DeviceState::NoPoolMatched {
        return current;
    }
    if obs.health_error || obs.infra_degraded {
        return DeviceState::Faulted;
    }
    match current {
        DeviceState::Discovered => {
            if !obs.bootstrapped {
                DeviceState::Discovered
            } else if obs.infra_ready {
                DeviceState::Ready
            } else {
                DeviceState::Validating
            }
        }
        DeviceState::Validating | DeviceState::Faulted => {
            if obs.infra_ready {
                DeviceState::Ready
            } else {
                DeviceState::Validating
            }
        }
        DeviceState::Ready => {
            if obs.infra_ready {
                DeviceState::Ready
            } else {
                DeviceState::Validating
            }
        }
        // Assignment states and NoPoolMatched handled above.
        other => other,
    }
}
