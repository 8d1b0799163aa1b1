//! Due-job polling with exponential backoff
//!
//! Backends that persist timers in a shared database (PostgreSQL) cannot
//! push fired jobs; they are polled instead. The poller claims due jobs in
//! batches, backs off while idle and resets as soon as work shows up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace};

use super::{JobSender, ScheduledJob};
use crate::duration_serde::millis as duration_millis;
use crate::persistence::StoreError;

/// Source of due jobs
#[async_trait]
pub trait JobSource: Send + Sync + 'static {
    /// Claim up to `limit` jobs whose fire time has passed
    async fn claim_due_jobs(&self, limit: usize) -> Result<Vec<ScheduledJob>, StoreError>;
}

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when jobs are due)
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no jobs found
    pub backoff_multiplier: f64,

    /// Maximum jobs to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(2),
            backoff_multiplier: 1.5,
            batch_size: 32,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Job poller with adaptive backoff
pub struct JobPoller {
    source: Arc<dyn JobSource>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    pub fn new(
        source: Arc<dyn JobSource>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim due jobs and update the backoff state
    #[instrument(skip(self))]
    pub async fn poll(&mut self) -> Result<Vec<ScheduledJob>, StoreError> {
        if *self.shutdown_rx.borrow() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let jobs = self.source.claim_due_jobs(self.config.batch_size).await?;

        if jobs.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No due jobs, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = jobs.len(), "Claimed due jobs");
        }

        Ok(jobs)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns `true` if shutdown was signaled.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

/// Run a poll loop forwarding claimed jobs to the dispatcher
pub fn spawn_poll_loop(
    source: Arc<dyn JobSource>,
    jobs: JobSender,
    config: PollerConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut poller = JobPoller::new(source, config, shutdown_rx);

        loop {
            if poller.is_shutdown() {
                debug!("Poll loop: shutdown requested");
                break;
            }

            match poller.poll().await {
                Ok(claimed) => {
                    for job in claimed {
                        if jobs.send(job).is_err() {
                            debug!("Poll loop: dispatcher closed");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("Job poll error: {}", e);
                }
            }

            if poller.wait().await {
                break;
            }
        }

        debug!("Poll loop exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobKind;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct QueueSource {
        due: Mutex<Vec<ScheduledJob>>,
    }

    #[async_trait]
    impl JobSource for QueueSource {
        async fn claim_due_jobs(&self, limit: usize) -> Result<Vec<ScheduledJob>, StoreError> {
            let mut due = self.due.lock();
            let take = limit.min(due.len());
            Ok(due.drain(..take).collect())
        }
    }

    fn job(tx: &str) -> ScheduledJob {
        ScheduledJob {
            kind: JobKind::Retry,
            workflow_id: "wf".to_string(),
            transaction_id: tx.to_string(),
            step_id: Some("a".to_string()),
            fire_at: Utc::now(),
            claim_token: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(2));
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_config_builder_clamps() {
        let config = PollerConfig::new()
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[tokio::test]
    async fn test_backoff_and_reset() {
        let source = Arc::new(QueueSource::default());
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(200))
            .with_backoff_multiplier(2.0);
        let mut poller = JobPoller::new(source.clone(), config, rx);

        assert!(poller.poll().await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        assert!(poller.poll().await.unwrap().is_empty());
        assert_eq!(poller.current_interval(), Duration::from_millis(200));

        source.due.lock().push(job("tx-1"));
        assert_eq!(poller.poll().await.unwrap().len(), 1);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_poll_loop_forwards_jobs_and_stops() {
        let source = Arc::new(QueueSource::default());
        source.due.lock().extend([job("tx-1"), job("tx-2")]);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (jobs_tx, mut jobs_rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = spawn_poll_loop(
            source,
            jobs_tx,
            PollerConfig::new().with_min_interval(Duration::from_millis(10)),
            shutdown_rx,
        );

        let first = jobs_rx.recv().await.unwrap();
        let second = jobs_rx.recv().await.unwrap();
        assert_eq!(first.transaction_id, "tx-1");
        assert_eq!(second.transaction_id, "tx-2");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
