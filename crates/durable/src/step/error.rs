//! Step error types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of step failures
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The handler returned an error
    Execution,

    /// The step did not finish before its deadline
    StepTimeout,

    /// The transaction deadline elapsed while the step was pending
    TransactionTimeout,

    /// A compensate handler failed
    Compensation,

    /// The retry budget was exhausted
    PermanentFailure,

    /// The transaction was cancelled while the step was pending
    Cancelled,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Execution => write!(f, "step_execution_error"),
            Self::StepTimeout => write!(f, "step_timeout_error"),
            Self::TransactionTimeout => write!(f, "transaction_timeout_error"),
            Self::Compensation => write!(f, "compensation_error"),
            Self::PermanentFailure => write!(f, "permanent_failure_error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Error returned by step handlers and recorded in transaction checkpoints
///
/// Handlers return [`StepError::new`] for transient failures that may be
/// retried, and [`StepError::permanent`] for failures that must not consume
/// further attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// What caused the failure
    pub kind: StepErrorKind,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether retries must be skipped
    #[serde(default)]
    pub permanent: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepError {
    /// Create a retryable execution error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: StepErrorKind::Execution,
            error_type: None,
            permanent: false,
            details: None,
        }
    }

    /// Create an execution error that skips the remaining retries
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(message)
        }
    }

    /// The step exceeded its own deadline
    pub fn step_timeout(step_id: &str, limit: Duration) -> Self {
        Self {
            kind: StepErrorKind::StepTimeout,
            ..Self::new(format!("step {step_id} timed out after {limit:?}"))
        }
    }

    /// The transaction deadline elapsed while the step was pending
    pub fn transaction_timeout(limit: Duration) -> Self {
        Self {
            kind: StepErrorKind::TransactionTimeout,
            permanent: true,
            ..Self::new(format!("transaction timed out after {limit:?}"))
        }
    }

    /// The transaction was cancelled while the step was pending
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            kind: StepErrorKind::Cancelled,
            permanent: true,
            ..Self::new(reason)
        }
    }

    /// Wrap the last failure of a step whose retries are exhausted
    ///
    /// A timed-out last attempt keeps its timeout kind.
    pub fn exhausted(step_id: &str, attempts: u32, last: &StepError) -> Self {
        let kind = if last.is_timeout() {
            last.kind
        } else {
            StepErrorKind::PermanentFailure
        };
        Self {
            message: format!(
                "step {step_id} failed after {attempts} attempts: {}",
                last.message
            ),
            kind,
            error_type: last.error_type.clone(),
            permanent: true,
            details: Some(serde_json::json!({ "cause": last.kind, "attempts": attempts })),
        }
    }

    /// Wrap a failed compensation
    pub fn compensation(step_id: &str, cause: &StepError) -> Self {
        Self {
            message: format!("compensation of step {step_id} failed: {}", cause.message),
            kind: StepErrorKind::Compensation,
            error_type: cause.error_type.clone(),
            permanent: true,
            details: cause.details.clone(),
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Whether the failure came from a deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.kind,
            StepErrorKind::StepTimeout | StepErrorKind::TransactionTimeout
        )
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::permanent(err.to_string()).with_type("INVALID_PAYLOAD")
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_retryable_by_default() {
        let error = StepError::new("connection reset");
        assert!(!error.permanent);
        assert_eq!(error.kind, StepErrorKind::Execution);
        assert_eq!(error.to_string(), "connection reset");
    }

    #[test]
    fn test_permanent_error() {
        let error = StepError::permanent("invalid input").with_type("VALIDATION");
        assert!(error.permanent);
        assert_eq!(error.error_type.as_deref(), Some("VALIDATION"));
    }

    #[test]
    fn test_exhausted_wraps_cause() {
        let last = StepError::new("gateway down");
        let error = StepError::exhausted("charge", 3, &last);

        assert_eq!(error.kind, StepErrorKind::PermanentFailure);
        assert!(error.permanent);
        assert!(error.message.contains("after 3 attempts"));
        assert_eq!(
            error.details,
            Some(serde_json::json!({ "cause": "execution", "attempts": 3 }))
        );
    }

    #[test]
    fn test_exhausted_keeps_timeout_kind() {
        let last = StepError::step_timeout("charge", Duration::from_millis(100));
        let error = StepError::exhausted("charge", 3, &last);

        assert_eq!(error.kind, StepErrorKind::StepTimeout);
        assert!(error.permanent);
        assert!(error.message.contains("after 3 attempts"));
        assert_eq!(
            error.details,
            Some(serde_json::json!({ "cause": "step_timeout", "attempts": 3 }))
        );
    }

    #[test]
    fn test_timeout_kinds() {
        assert!(StepError::step_timeout("a", Duration::from_secs(1)).is_timeout());
        assert!(StepError::transaction_timeout(Duration::from_secs(1)).is_timeout());
        assert!(!StepError::cancelled("stop").is_timeout());
    }

    #[test]
    fn test_step_error_serialization() {
        let error = StepError::new("boom")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        assert!(json.contains("\"kind\":\"execution\""));

        let parsed: StepError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }

    #[test]
    fn test_from_anyhow() {
        let error: StepError = anyhow::anyhow!("upstream unavailable").into();
        assert!(!error.permanent);
        assert_eq!(error.message, "upstream unavailable");
    }
}
