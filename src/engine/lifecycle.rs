use std::fmt;

use serde::Serialize;

/// Phase of a strategy instance.
///
/// A tick walks `Idle -> Quoting -> Reconciling -> Idle`. A stop request
/// moves any phase to `Stopping`, and `Stopped` is final.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Idle,
    Quoting,
    Reconciling,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Quoting => "quoting",
            Self::Reconciling => "reconciling",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Quoting)
                | (Quoting, Reconciling)
                | (Quoting, Idle)
                | (Reconciling, Idle)
                | (Idle | Quoting | Reconciling, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::LifecycleState::*;

    #[test]
    fn test_tick_cycle() {
        assert!(Idle.can_transition_to(Quoting));
        assert!(Quoting.can_transition_to(Reconciling));
        assert!(Reconciling.can_transition_to(Idle));
        // aborted tick
        assert!(Quoting.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Reconciling));
    }

    #[test]
    fn test_stop_is_one_way() {
        for state in [Idle, Quoting, Reconciling] {
            assert!(state.can_transition_to(Stopping));
        }
        assert!(Stopping.can_transition_to(Stopped));
        for next in [Idle, Quoting, Reconciling, Stopping] {
            assert!(!Stopped.can_transition_to(next));
        }
        assert!(!Stopping.can_transition_to(Idle));
    }
}
