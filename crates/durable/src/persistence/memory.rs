//! In-memory implementation of CheckpointStorage

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::execution_log::{ExecutionLog, ExecutionRecord, InMemoryExecutionLog};
use super::store::{CheckpointStorage, StoreError};
use super::DEFAULT_COMPLETED_TTL;
use crate::duration_serde::to_chrono;
use crate::scheduler::{JobSender, ScheduledJob};
use crate::transaction::TransactionCheckpoint;

struct StoredCheckpoint {
    checkpoint: TransactionCheckpoint,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredCheckpoint {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

/// In-memory implementation of CheckpointStorage
///
/// Suitable for a single node and for tests. Timers are tokio tasks; a
/// timer that was cleared or replaced never delivers its job. Snapshots with
/// an expiry are evicted by their own timer once it passes. Nothing survives
/// a process restart.
///
/// # Example
///
/// ```
/// use sagaflow_durable::InMemoryCheckpointStorage;
///
/// let storage = InMemoryCheckpointStorage::new();
/// ```
pub struct InMemoryCheckpointStorage {
    checkpoints: Arc<RwLock<HashMap<String, StoredCheckpoint>>>,
    timers: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    evictions: Arc<Mutex<HashMap<String, ArmedTimer>>>,
    jobs: RwLock<Option<JobSender>>,
    execution_log: Arc<dyn ExecutionLog>,
    generation: AtomicU64,
    completed_ttl: Duration,
}

impl Default for InMemoryCheckpointStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self {
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            timers: Arc::new(Mutex::new(HashMap::new())),
            evictions: Arc::new(Mutex::new(HashMap::new())),
            jobs: RwLock::new(None),
            execution_log: Arc::new(InMemoryExecutionLog::new()),
            generation: AtomicU64::new(0),
            completed_ttl: DEFAULT_COMPLETED_TTL,
        }
    }

    /// Use a different execution log
    pub fn with_execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.execution_log = log;
        self
    }

    /// How long finished snapshots stay readable
    pub fn with_completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = ttl;
        self
    }

    pub fn execution_log(&self) -> Arc<dyn ExecutionLog> {
        Arc::clone(&self.execution_log)
    }

    /// Number of stored checkpoints, expired ones included until evicted
    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }

    /// Number of armed timers
    pub fn pending_timers(&self) -> usize {
        self.timers.lock().len()
    }

    /// Whether a timer with this id is armed
    pub fn has_timer(&self, job_id: &str) -> bool {
        self.timers.lock().contains_key(job_id)
    }

    /// Arm, replace or disarm the eviction timer of a key
    fn arm_eviction(&self, key: &str, expires_at: Option<DateTime<Utc>>) {
        let mut armed = self.evictions.lock();
        if let Some(previous) = armed.remove(key) {
            previous.handle.abort();
        }
        let Some(expires_at) = expires_at else {
            return;
        };

        let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let checkpoints = Arc::clone(&self.checkpoints);
        let evictions = Arc::clone(&self.evictions);
        let owned_key = key.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut evictions = evictions.lock();
                match evictions.get(&owned_key) {
                    Some(timer) if timer.generation == generation => {
                        evictions.remove(&owned_key);
                    }
                    _ => return,
                }
            }
            let now = Utc::now();
            let mut checkpoints = checkpoints.write();
            if checkpoints
                .get(&owned_key)
                .is_some_and(|stored| !stored.is_live_at(now))
            {
                checkpoints.remove(&owned_key);
                debug!(key = %owned_key, "Evicted expired checkpoint");
            }
        });

        armed.insert(
            key.to_string(),
            ArmedTimer {
                generation,
                handle: handle.abort_handle(),
            },
        );
    }

    fn expiry_for(&self, checkpoint: &TransactionCheckpoint, ttl: Option<Duration>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if checkpoint.is_terminal() {
            let keep = checkpoint
                .flow
                .options
                .retention_time
                .map_or(self.completed_ttl, |retention| retention.max(self.completed_ttl));
            Some(now + to_chrono(keep))
        } else {
            ttl.map(|ttl| now + to_chrono(ttl))
        }
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn get(&self, key: &str) -> Result<Option<TransactionCheckpoint>, StoreError> {
        let now = Utc::now();
        Ok(self
            .checkpoints
            .read()
            .get(key)
            .filter(|stored| stored.is_live_at(now))
            .map(|stored| stored.checkpoint.clone()))
    }

    async fn list(&self) -> Result<Vec<TransactionCheckpoint>, StoreError> {
        let now = Utc::now();
        Ok(self
            .checkpoints
            .read()
            .values()
            .filter(|stored| stored.is_live_at(now))
            .map(|stored| stored.checkpoint.clone())
            .collect())
    }

    async fn save(
        &self,
        key: &str,
        checkpoint: &TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let version = checkpoint.version + 1;
        let expires_at = self.expiry_for(checkpoint, ttl, now);
        {
            let mut checkpoints = self.checkpoints.write();
            if let Some(existing) = checkpoints.get(key) {
                if existing.is_live_at(now) && existing.checkpoint.version != checkpoint.version {
                    return Err(StoreError::ConcurrencyConflict {
                        key: key.to_string(),
                        expected: checkpoint.version,
                        actual: existing.checkpoint.version,
                    });
                }
            }

            let mut stored = checkpoint.clone();
            stored.version = version;
            checkpoints.insert(
                key.to_string(),
                StoredCheckpoint {
                    checkpoint: stored,
                    expires_at,
                },
            );
        }
        self.arm_eviction(key, expires_at);

        if checkpoint.is_terminal() && checkpoint.flow.options.retention_time.is_none() {
            self.execution_log
                .delete(checkpoint.workflow_id(), checkpoint.transaction_id())
                .await?;
        } else {
            self.execution_log
                .upsert(ExecutionRecord::from_checkpoint(checkpoint)?)
                .await?;
        }

        debug!(%key, version, state = %checkpoint.state(), "Saved checkpoint");
        Ok(version)
    }

    async fn schedule(&self, job: ScheduledJob) -> Result<(), StoreError> {
        let Some(sender) = self.jobs.read().clone() else {
            warn!(job_id = %job.job_id(), "No scheduler attached, timer not armed");
            return Ok(());
        };

        let job_id = job.job_id();
        let delay = (job.fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let fired_id = job_id.clone();

        let mut armed = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = {
                let mut timers = timers.lock();
                match timers.get(&fired_id) {
                    Some(timer) if timer.generation == generation => {
                        timers.remove(&fired_id);
                        true
                    }
                    _ => false,
                }
            };
            if current && sender.send(job).is_err() {
                debug!(job_id = %fired_id, "Dispatcher gone, dropping fired timer");
            }
        });

        if let Some(previous) = armed.insert(
            job_id,
            ArmedTimer {
                generation,
                handle: handle.abort_handle(),
            },
        ) {
            previous.handle.abort();
        }
        Ok(())
    }

    async fn clear(&self, job_id: &str) -> Result<(), StoreError> {
        if let Some(timer) = self.timers.lock().remove(job_id) {
            timer.handle.abort();
        }
        Ok(())
    }

    fn attach_scheduler(&self, jobs: JobSender) {
        *self.jobs.write() = Some(jobs);
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let removed = {
            let mut checkpoints = self.checkpoints.write();
            let before = checkpoints.len();
            checkpoints.retain(|_, stored| stored.is_live_at(now));
            before - checkpoints.len()
        };
        let records = self.execution_log.purge_expired().await?;
        Ok(removed + records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::JobKind;
    use crate::step::handler_fn;
    use crate::transaction::TransactionState;
    use crate::workflow::{StepDefinition, WorkflowBuilder};
    use serde_json::Value;

    fn checkpoint(retention: Option<Duration>) -> TransactionCheckpoint {
        let mut builder = WorkflowBuilder::new("wf").step(StepDefinition::new(
            "a",
            handler_fn(|_| async { Ok(Value::Null) }),
        ));
        if let Some(retention) = retention {
            builder = builder.retention_time(retention);
        }
        TransactionCheckpoint::new(&builder.build().unwrap(), "tx-1", Value::Null, Value::Null)
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let storage = InMemoryCheckpointStorage::new();
        let mut cp = checkpoint(None);

        cp.version = storage.save(&cp.key(), &cp, None).await.unwrap();
        assert_eq!(cp.version, 1);

        let loaded = storage.get(&cp.key()).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(storage.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let storage = InMemoryCheckpointStorage::new();
        let cp = checkpoint(None);
        let key = cp.key();

        storage.save(&key, &cp, None).await.unwrap();
        let err = storage.save(&key, &cp, None).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrencyConflict {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_terminal_without_retention_drops_execution_record() {
        let log = Arc::new(InMemoryExecutionLog::new());
        let storage = InMemoryCheckpointStorage::new().with_execution_log(log.clone());
        let mut cp = checkpoint(None);

        cp.version = storage.save(&cp.key(), &cp, None).await.unwrap();
        assert_eq!(log.len(), 1);

        cp.flow.state = TransactionState::Done;
        storage.save(&cp.key(), &cp, None).await.unwrap();
        assert!(log.is_empty());
        // snapshot stays readable for the completed ttl
        assert!(storage.get(&cp.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminal_with_retention_keeps_execution_record() {
        let log = Arc::new(InMemoryExecutionLog::new());
        let storage = InMemoryCheckpointStorage::new().with_execution_log(log.clone());
        let mut cp = checkpoint(Some(Duration::from_secs(60)));
        cp.flow.state = TransactionState::Reverted;

        storage.save(&cp.key(), &cp, None).await.unwrap();
        let record = log.get("wf", "tx-1").await.unwrap().unwrap();
        assert_eq!(record.state, TransactionState::Reverted);
        assert_eq!(record.retention_time, Some(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_expired_checkpoint_reads_absent_and_is_purged() {
        let storage = InMemoryCheckpointStorage::new().with_completed_ttl(Duration::ZERO);
        let mut cp = checkpoint(None);
        cp.flow.state = TransactionState::Done;

        storage.save(&cp.key(), &cp, None).await.unwrap();
        assert!(storage.get(&cp.key()).await.unwrap().is_none());
        assert_eq!(storage.purge_expired().await.unwrap(), 1);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_finished_checkpoints_are_evicted_after_completed_ttl() {
        let storage = InMemoryCheckpointStorage::new().with_completed_ttl(Duration::from_millis(50));
        for i in 0..20 {
            let mut cp = checkpoint(None);
            cp.flow.state = TransactionState::Done;
            let key = format!("saga:wf:done-{i}");
            storage.save(&key, &cp, None).await.unwrap();
        }
        let mut running = checkpoint(None);
        running.flow.state = TransactionState::Invoking;
        storage.save(&running.key(), &running, None).await.unwrap();
        assert_eq!(storage.len(), 21);

        tokio::time::sleep(Duration::from_millis(200)).await;
        // Only the unfinished transaction remains
        assert_eq!(storage.len(), 1);
        assert!(storage.get(&running.key()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_resaved_key_keeps_its_new_snapshot() {
        let storage = InMemoryCheckpointStorage::new();
        let mut cp = checkpoint(None);
        let key = cp.key();

        // A short ttl arms eviction; saving again without one disarms it
        cp.version = storage
            .save(&key, &cp, Some(Duration::from_millis(30)))
            .await
            .unwrap();
        storage.save(&key, &cp, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get(&key).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_timer_fires_once() {
        let storage = InMemoryCheckpointStorage::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        storage.attach_scheduler(tx);
        let cp = checkpoint(None);

        storage
            .schedule_retry(&cp, "a", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(storage.has_timer("retry:wf:tx-1:a"));

        let job = rx.recv().await.unwrap();
        assert_eq!(job.kind, JobKind::Retry);
        assert_eq!(job.step_id.as_deref(), Some("a"));
        assert_eq!(storage.pending_timers(), 0);
    }

    #[tokio::test]
    async fn test_cleared_timer_never_fires() {
        let storage = InMemoryCheckpointStorage::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        storage.attach_scheduler(tx);
        let cp = checkpoint(None);

        storage
            .schedule_step_timeout(&cp, "a", Duration::from_millis(20))
            .await
            .unwrap();
        storage.clear_step_timeout(&cp, "a").await.unwrap();
        assert_eq!(storage.pending_timers(), 0);

        let fired = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn test_rescheduling_replaces_timer() {
        let storage = InMemoryCheckpointStorage::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        storage.attach_scheduler(tx);
        let cp = checkpoint(None);

        storage
            .schedule_transaction_timeout(&cp, Duration::from_millis(10))
            .await
            .unwrap();
        storage
            .schedule_transaction_timeout(&cp, Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(storage.pending_timers(), 1);

        let job = rx.recv().await.unwrap();
        assert_eq!(job.kind, JobKind::TransactionTimeout);
        let again = tokio::time::timeout(Duration::from_millis(80), rx.recv()).await;
        assert!(again.is_err());
    }
}
