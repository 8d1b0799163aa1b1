//! Delivery of fired jobs to the orchestrator

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{JobReceiver, ScheduledJob};
use crate::persistence::CheckpointStorage;
use crate::reliability::RetryPolicy;

/// Errors from delivering a job
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Storage or transport failure; delivery is retried
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    /// The job can never succeed (unknown workflow, purged transaction, ...)
    #[error("job rejected: {0}")]
    Rejected(String),
}

/// Receiver of fired jobs
#[async_trait]
pub trait JobTarget: Send + Sync + 'static {
    /// Re-enter the transaction the job belongs to
    async fn fire(&self, job: &ScheduledJob) -> Result<(), DispatchError>;
}

/// Receives fired jobs and re-enters their transactions
///
/// Each job is handled on its own task so one slow transaction never delays
/// the timers of another. Transient failures are retried with the configured
/// policy; a job whose retries are exhausted is left unacknowledged so a
/// leasing backend can redeliver it.
pub struct JobDispatcher {
    target: Weak<dyn JobTarget>,
    storage: Arc<dyn CheckpointStorage>,
    retry: RetryPolicy,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobDispatcher {
    pub fn new(
        target: Weak<dyn JobTarget>,
        storage: Arc<dyn CheckpointStorage>,
        retry: RetryPolicy,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            target,
            storage,
            retry,
            shutdown_rx,
        }
    }

    /// Start consuming fired jobs
    pub fn spawn(self, jobs: JobReceiver) -> JoinHandle<()> {
        tokio::spawn(self.run(jobs))
    }

    async fn run(self, mut jobs: JobReceiver) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let job = tokio::select! {
                job = jobs.recv() => job,
                _ = shutdown_rx.changed() => {
                    debug!("Dispatcher: shutdown requested");
                    break;
                }
            };

            let Some(job) = job else {
                debug!("Dispatcher: job channel closed");
                break;
            };

            let target = self.target.clone();
            let storage = Arc::clone(&self.storage);
            let retry = self.retry.clone();
            tokio::spawn(async move {
                deliver(target, storage, retry, job).await;
            });
        }

        debug!("Dispatcher exited");
    }
}

async fn deliver(
    target: Weak<dyn JobTarget>,
    storage: Arc<dyn CheckpointStorage>,
    retry: RetryPolicy,
    job: ScheduledJob,
) {
    let job_id = job.job_id();
    let mut failures = 0;

    loop {
        let Some(target) = target.upgrade() else {
            debug!(%job_id, "Dispatcher target dropped");
            return;
        };

        match target.fire(&job).await {
            Ok(()) => break,
            Err(DispatchError::Rejected(reason)) => {
                warn!(%job_id, %reason, "Dropping scheduled job");
                break;
            }
            Err(DispatchError::Transient(reason)) => {
                failures += 1;
                if !retry.has_retries_remaining(failures) {
                    error!(%job_id, %reason, failures, "Giving up on scheduled job");
                    return;
                }
                let delay = retry.delay_for_retry(failures);
                warn!(%job_id, %reason, delay_ms = delay.as_millis() as u64, "Retrying scheduled job");
                drop(target);
                tokio::time::sleep(delay).await;
            }
        }
    }

    if let Err(e) = storage.ack_job(&job).await {
        error!(%job_id, "Failed to acknowledge job: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryCheckpointStorage;
    use crate::scheduler::JobKind;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct FlakyTarget {
        failures_left: Mutex<u32>,
        fired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobTarget for FlakyTarget {
        async fn fire(&self, job: &ScheduledJob) -> Result<(), DispatchError> {
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(DispatchError::Transient("database unavailable".to_string()));
            }
            self.fired.lock().push(job.job_id());
            Ok(())
        }
    }

    fn job() -> ScheduledJob {
        ScheduledJob {
            kind: JobKind::StepTimeout,
            workflow_id: "wf".to_string(),
            transaction_id: "tx".to_string(),
            step_id: Some("a".to_string()),
            fire_at: Utc::now(),
            claim_token: None,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let target = Arc::new(FlakyTarget {
            failures_left: Mutex::new(2),
            fired: Mutex::new(vec![]),
        });
        let as_target: Arc<dyn JobTarget> = target.clone();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (jobs_tx, jobs_rx) = tokio::sync::mpsc::unbounded_channel();

        let dispatcher = JobDispatcher::new(
            Arc::downgrade(&as_target),
            Arc::new(InMemoryCheckpointStorage::new()),
            RetryPolicy::fixed(Duration::from_millis(5), 3),
            shutdown_rx,
        );
        let _handle = dispatcher.spawn(jobs_rx);
        jobs_tx.send(job()).unwrap();

        for _ in 0..100 {
            if !target.fired.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*target.fired.lock(), vec!["step_timeout:wf:tx:a".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatcher() {
        let target: Arc<dyn JobTarget> = Arc::new(FlakyTarget {
            failures_left: Mutex::new(0),
            fired: Mutex::new(vec![]),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_jobs_tx, jobs_rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = JobDispatcher::new(
            Arc::downgrade(&target),
            Arc::new(InMemoryCheckpointStorage::new()),
            RetryPolicy::no_retry(),
            shutdown_rx,
        )
        .spawn(jobs_rx);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
