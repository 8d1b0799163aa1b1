//! Scheduled re-entry jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::transaction::TransactionCheckpoint;

/// Why a transaction must be re-entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A step's retry interval elapsed
    Retry,
    /// A step's deadline elapsed
    StepTimeout,
    /// The transaction deadline elapsed
    TransactionTimeout,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Retry => "retry",
            JobKind::StepTimeout => "step_timeout",
            JobKind::TransactionTimeout => "transaction_timeout",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(JobKind::Retry),
            "step_timeout" => Ok(JobKind::StepTimeout),
            "transaction_timeout" => Ok(JobKind::TransactionTimeout),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// A timer that re-enters a transaction when it fires
///
/// At most one job exists per `(kind, transaction, step)`; scheduling again
/// replaces the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub kind: JobKind,
    pub workflow_id: String,
    pub transaction_id: String,
    pub step_id: Option<String>,
    pub fire_at: DateTime<Utc>,
    /// Set by backends that lease jobs to a single node
    pub claim_token: Option<Uuid>,
}

impl ScheduledJob {
    pub fn new(
        kind: JobKind,
        checkpoint: &TransactionCheckpoint,
        step_id: Option<&str>,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            workflow_id: checkpoint.workflow_id().to_string(),
            transaction_id: checkpoint.transaction_id().to_string(),
            step_id: step_id.map(str::to_string),
            fire_at,
            claim_token: None,
        }
    }

    /// Stable identity of the timer
    pub fn job_id(&self) -> String {
        job_id(
            self.kind,
            &self.workflow_id,
            &self.transaction_id,
            self.step_id.as_deref(),
        )
    }
}

/// Identity of the timer of a given kind for a transaction (and step)
pub fn job_id(kind: JobKind, workflow_id: &str, transaction_id: &str, step_id: Option<&str>) -> String {
    match step_id {
        Some(step_id) => format!("{kind}:{workflow_id}:{transaction_id}:{step_id}"),
        None => format!("{kind}:{workflow_id}:{transaction_id}"),
    }
}

/// Channel on which fired jobs are delivered to the dispatcher
pub type JobSender = mpsc::UnboundedSender<ScheduledJob>;
pub type JobReceiver = mpsc::UnboundedReceiver<ScheduledJob>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids() {
        assert_eq!(
            job_id(JobKind::Retry, "order", "tx-1", Some("charge")),
            "retry:order:tx-1:charge"
        );
        assert_eq!(
            job_id(JobKind::TransactionTimeout, "order", "tx-1", None),
            "transaction_timeout:order:tx-1"
        );
    }

    #[test]
    fn test_kind_parse() {
        for kind in [JobKind::Retry, JobKind::StepTimeout, JobKind::TransactionTimeout] {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!("sleep".parse::<JobKind>().is_err());
    }
}
