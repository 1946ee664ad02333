//! Stage lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle state of a stage within one execution.
///
/// `Pending → Running → {Succeeded | Failed}`, with `Retrying → Running`
/// loops for retried attempts. `Skipped` marks stages that never started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Waiting for dependencies or a free slot.
    #[default]
    Pending,
    /// An attempt is in flight.
    Running,
    /// A failed attempt is about to be retried with a narrower scope.
    Retrying,
    /// The stage completed.
    Succeeded,
    /// The stage failed permanently, or a dependency did.
    Failed,
    /// The stage never started because the execution was aborted.
    Skipped,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl StageState {
    /// Returns true if the state can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Returns true if the stage is occupying a concurrency slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Retrying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_display() {
        assert_eq!(StageState::Pending.to_string(), "pending");
        assert_eq!(StageState::Succeeded.to_string(), "succeeded");
        assert_eq!(StageState::Retrying.to_string(), "retrying");
    }

    #[test]
    fn test_stage_state_is_terminal() {
        assert!(StageState::Succeeded.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(StageState::Skipped.is_terminal());
        assert!(!StageState::Pending.is_terminal());
        assert!(!StageState::Running.is_terminal());
    }

    #[test]
    fn test_stage_state_serialize() {
        let json = serde_json::to_string(&StageState::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);
        let back: StageState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageState::Succeeded);
    }
}
