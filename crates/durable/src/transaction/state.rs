//! Transaction and step state machines

use serde::{Deserialize, Serialize};

/// Lifecycle of a whole transaction
///
/// ```text
/// NotStarted → Invoking → Done
///                  │
///                  ├────────→ Failed          (continue-on-failure without revert)
///                  ↓
///             Compensating → Reverted
///                  │
///                  └───────→ Failed          (partial compensation)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    NotStarted,
    Invoking,
    Compensating,
    Done,
    Failed,
    Reverted,
}

impl TransactionState {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Done | TransactionState::Failed | TransactionState::Reverted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::NotStarted => write!(f, "not_started"),
            TransactionState::Invoking => write!(f, "invoking"),
            TransactionState::Compensating => write!(f, "compensating"),
            TransactionState::Done => write!(f, "done"),
            TransactionState::Failed => write!(f, "failed"),
            TransactionState::Reverted => write!(f, "reverted"),
        }
    }
}

/// Where a step is in its forward or compensating lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    NotStarted,
    Invoking,
    Done,
    Failed,
    TimedOut,
    Compensating,
    Reverted,
    Skipped,
}

impl StepState {
    /// The step ended its forward lifecycle without producing output
    pub fn is_forward_failure(&self) -> bool {
        matches!(self, StepState::Failed | StepState::TimedOut)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::NotStarted => write!(f, "not_started"),
            StepState::Invoking => write!(f, "invoking"),
            StepState::Done => write!(f, "done"),
            StepState::Failed => write!(f, "failed"),
            StepState::TimedOut => write!(f, "timed_out"),
            StepState::Compensating => write!(f, "compensating"),
            StepState::Reverted => write!(f, "reverted"),
            StepState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Outcome of the latest attempt within the current state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    Idle,
    /// Async step whose handler returned; awaiting an external callback
    Waiting,
    Ok,
    /// Failed attempt with a retry pending
    TemporaryFailure,
    PermanentFailure,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Idle => write!(f, "idle"),
            StepStatus::Waiting => write!(f, "waiting"),
            StepStatus::Ok => write!(f, "ok"),
            StepStatus::TemporaryFailure => write!(f, "temporary_failure"),
            StepStatus::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TransactionState::NotStarted.is_terminal());
        assert!(!TransactionState::Invoking.is_terminal());
        assert!(!TransactionState::Compensating.is_terminal());
        assert!(TransactionState::Done.is_terminal());
        assert!(TransactionState::Failed.is_terminal());
        assert!(TransactionState::Reverted.is_terminal());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&StepState::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        assert_eq!(StepState::TimedOut.to_string(), "timed_out");
        assert_eq!(TransactionState::Reverted.to_string(), "reverted");
    }
}
