//! CheckpointStorage trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;

use crate::duration_serde::to_chrono;
use crate::scheduler::{JobKind, JobSender, ScheduledJob};
use crate::transaction::TransactionCheckpoint;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Checkpoint not found
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Timer could not be scheduled or cleared
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

impl StoreError {
    /// Whether retrying the operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Scheduler(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Persistence of transaction checkpoints and their timers
///
/// Implementations must:
/// - Reject a `save` whose `checkpoint.version` does not match the stored
///   version ([`StoreError::ConcurrencyConflict`]), and return the new version
/// - Apply retention when a terminal checkpoint is saved: drop the execution
///   record unless `retention_time` is set, and keep the snapshot readable
///   only for a bounded time
/// - Keep at most one timer per `(kind, transaction, step)`; scheduling
///   replaces and clearing cancels it, and a cleared timer must never fire
/// - Deliver fired timers to the sender given to [`attach_scheduler`]
///
/// [`attach_scheduler`]: CheckpointStorage::attach_scheduler
#[async_trait]
pub trait CheckpointStorage: Send + Sync + 'static {
    /// Load a checkpoint; expired checkpoints read as absent
    async fn get(&self, key: &str) -> Result<Option<TransactionCheckpoint>, StoreError>;

    /// All live checkpoints
    async fn list(&self) -> Result<Vec<TransactionCheckpoint>, StoreError>;

    /// Persist a checkpoint, returning its new version
    ///
    /// `ttl` bounds how long a non-terminal checkpoint stays readable.
    async fn save(
        &self,
        key: &str,
        checkpoint: &TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError>;

    /// Persist a timer and arm it
    async fn schedule(&self, job: ScheduledJob) -> Result<(), StoreError>;

    /// Cancel a timer if it has not fired yet
    async fn clear(&self, job_id: &str) -> Result<(), StoreError>;

    /// Register the channel fired timers are delivered to
    fn attach_scheduler(&self, jobs: JobSender);

    /// Start any background work needed to deliver timers
    async fn start_scheduler(&self, _shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        Ok(())
    }

    /// Confirm a delivered timer was handled
    async fn ack_job(&self, _job: &ScheduledJob) -> Result<(), StoreError> {
        Ok(())
    }

    /// Remove expired checkpoints and execution records
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// Re-enter the transaction after `interval` to retry `step_id`
    async fn schedule_retry(
        &self,
        checkpoint: &TransactionCheckpoint,
        step_id: &str,
        interval: Duration,
    ) -> Result<(), StoreError> {
        self.schedule(timer(JobKind::Retry, checkpoint, Some(step_id), interval))
            .await
    }

    async fn clear_retry(
        &self,
        checkpoint: &TransactionCheckpoint,
        step_id: &str,
    ) -> Result<(), StoreError> {
        self.clear(&timer_id(JobKind::Retry, checkpoint, Some(step_id)))
            .await
    }

    /// Re-enter the transaction when its deadline elapses
    async fn schedule_transaction_timeout(
        &self,
        checkpoint: &TransactionCheckpoint,
        interval: Duration,
    ) -> Result<(), StoreError> {
        self.schedule(timer(JobKind::TransactionTimeout, checkpoint, None, interval))
            .await
    }

    async fn clear_transaction_timeout(
        &self,
        checkpoint: &TransactionCheckpoint,
    ) -> Result<(), StoreError> {
        self.clear(&timer_id(JobKind::TransactionTimeout, checkpoint, None))
            .await
    }

    /// Re-enter the transaction when a step deadline elapses
    async fn schedule_step_timeout(
        &self,
        checkpoint: &TransactionCheckpoint,
        step_id: &str,
        interval: Duration,
    ) -> Result<(), StoreError> {
        self.schedule(timer(JobKind::StepTimeout, checkpoint, Some(step_id), interval))
            .await
    }

    async fn clear_step_timeout(
        &self,
        checkpoint: &TransactionCheckpoint,
        step_id: &str,
    ) -> Result<(), StoreError> {
        self.clear(&timer_id(JobKind::StepTimeout, checkpoint, Some(step_id)))
            .await
    }
}

fn timer(
    kind: JobKind,
    checkpoint: &TransactionCheckpoint,
    step_id: Option<&str>,
    interval: Duration,
) -> ScheduledJob {
    ScheduledJob::new(kind, checkpoint, step_id, Utc::now() + to_chrono(interval))
}

fn timer_id(kind: JobKind, checkpoint: &TransactionCheckpoint, step_id: Option<&str>) -> String {
    crate::scheduler::job_id(
        kind,
        checkpoint.workflow_id(),
        checkpoint.transaction_id(),
        step_id,
    )
}
