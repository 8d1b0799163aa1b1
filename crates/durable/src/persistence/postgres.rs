//! PostgreSQL implementation of CheckpointStorage
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via a version column
//! - Durable timers claimed with SKIP LOCKED and leased to one node
//! - A queryable execution log with retention

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::execution_log::{ExecutionContext, ExecutionLog, ExecutionRecord};
use super::store::{CheckpointStorage, StoreError};
use super::DEFAULT_COMPLETED_TTL;
use crate::duration_serde::{millis as duration_millis, to_chrono};
use crate::scheduler::{spawn_poll_loop, JobKind, JobSender, JobSource, PollerConfig, ScheduledJob};
use crate::transaction::{TransactionCheckpoint, TransactionState};

/// PostgreSQL storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresStorageConfig {
    /// Due-job polling
    pub poller: PollerConfig,

    /// How long a claimed job stays invisible to other nodes before it is
    /// redelivered
    #[serde(with = "duration_millis")]
    pub job_lease: Duration,

    /// How long finished snapshots stay readable
    #[serde(with = "duration_millis")]
    pub completed_ttl: Duration,
}

impl Default for PostgresStorageConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            job_lease: Duration::from_secs(30),
            completed_ttl: DEFAULT_COMPLETED_TTL,
        }
    }
}

impl PostgresStorageConfig {
    /// Create from environment variables
    ///
    /// - `SAGA_SCHEDULER_POLL_MS`: minimum poll interval
    /// - `SAGA_JOB_LEASE_SECS`: job lease
    /// - `SAGA_COMPLETED_TTL_SECS`: finished snapshot lifetime
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_u64("SAGA_SCHEDULER_POLL_MS") {
            config.poller = config.poller.with_min_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = env_u64("SAGA_JOB_LEASE_SECS") {
            config.job_lease = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("SAGA_COMPLETED_TTL_SECS") {
            config.completed_ttl = Duration::from_secs(secs);
        }

        config
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_job_lease(mut self, lease: Duration) -> Self {
        self.job_lease = lease;
        self
    }

    pub fn with_completed_ttl(mut self, ttl: Duration) -> Self {
        self.completed_ttl = ttl;
        self
    }
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn db_error(context: &'static str) -> impl Fn(sqlx::Error) -> StoreError {
    move |e| {
        error!("{}: {}", context, e);
        StoreError::Database(e.to_string())
    }
}

/// PostgreSQL implementation of CheckpointStorage
///
/// # Example
///
/// ```ignore
/// use sagaflow_durable::PostgresCheckpointStorage;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/sagas").await?;
/// let storage = PostgresCheckpointStorage::new(pool);
/// storage.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresCheckpointStorage {
    pool: PgPool,
    config: PostgresStorageConfig,
    execution_log: Arc<dyn ExecutionLog>,
    jobs: Arc<RwLock<Option<JobSender>>>,
    poll_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PostgresCheckpointStorage {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, PostgresStorageConfig::default())
    }

    pub fn with_config(pool: PgPool, config: PostgresStorageConfig) -> Self {
        let execution_log = Arc::new(PostgresExecutionLog::new(pool.clone()));
        Self {
            pool,
            config,
            execution_log,
            jobs: Arc::new(RwLock::new(None)),
            poll_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Use a different execution log
    pub fn with_execution_log(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.execution_log = log;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &PostgresStorageConfig {
        &self.config
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn current_version(&self, key: &str) -> Result<u64, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM saga_checkpoints WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("Failed to read checkpoint version"))?;
        Ok(version.unwrap_or(0) as u64)
    }
}

fn decode_checkpoint(data: serde_json::Value, version: i64) -> Result<TransactionCheckpoint, StoreError> {
    let mut checkpoint: TransactionCheckpoint = serde_json::from_value(data)?;
    checkpoint.version = version as u64;
    Ok(checkpoint)
}

#[async_trait]
impl CheckpointStorage for PostgresCheckpointStorage {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<TransactionCheckpoint>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data, version
            FROM saga_checkpoints
            WHERE key = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load checkpoint"))?;

        row.map(|row| decode_checkpoint(row.get("data"), row.get("version")))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<TransactionCheckpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data, version
            FROM saga_checkpoints
            WHERE expires_at IS NULL OR expires_at > NOW()
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list checkpoints"))?;

        rows.into_iter()
            .map(|row| decode_checkpoint(row.get("data"), row.get("version")))
            .collect()
    }

    #[instrument(skip(self, checkpoint), fields(version = checkpoint.version, state = %checkpoint.state()))]
    async fn save(
        &self,
        key: &str,
        checkpoint: &TransactionCheckpoint,
        ttl: Option<Duration>,
    ) -> Result<u64, StoreError> {
        let now = Utc::now();
        let version = checkpoint.version + 1;
        let terminal = checkpoint.is_terminal();
        let retention = checkpoint.flow.options.retention_time;

        let expires_at: Option<DateTime<Utc>> = if terminal {
            let keep = retention.map_or(self.config.completed_ttl, |r| r.max(self.config.completed_ttl));
            Some(now + to_chrono(keep))
        } else {
            ttl.map(|ttl| now + to_chrono(ttl))
        };

        let mut stored = checkpoint.clone();
        stored.version = version;
        let data = serde_json::to_value(&stored)?;

        // Insert, or update only if nobody else wrote since we loaded
        let result = sqlx::query(
            r#"
            INSERT INTO saga_checkpoints
                (key, workflow_id, transaction_id, state, data, version, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (key) DO UPDATE
            SET state = EXCLUDED.state,
                data = EXCLUDED.data,
                version = EXCLUDED.version,
                expires_at = EXCLUDED.expires_at,
                updated_at = NOW()
            WHERE saga_checkpoints.version = $8
               OR (saga_checkpoints.expires_at IS NOT NULL AND saga_checkpoints.expires_at <= NOW())
            "#,
        )
        .bind(key)
        .bind(checkpoint.workflow_id())
        .bind(checkpoint.transaction_id())
        .bind(checkpoint.state().to_string())
        .bind(&data)
        .bind(version as i64)
        .bind(expires_at)
        .bind(checkpoint.version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to save checkpoint"))?;

        if result.rows_affected() == 0 {
            let actual = self.current_version(key).await?;
            return Err(StoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected: checkpoint.version,
                actual,
            });
        }

        if terminal && retention.is_none() {
            self.execution_log
                .delete(checkpoint.workflow_id(), checkpoint.transaction_id())
                .await?;
        } else {
            self.execution_log
                .upsert(ExecutionRecord::from_checkpoint(checkpoint)?)
                .await?;
        }

        debug!(%key, version, "saved checkpoint");
        Ok(version)
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id()))]
    async fn schedule(&self, job: ScheduledJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO saga_scheduled_jobs
                (job_id, kind, workflow_id, transaction_id, step_id, fire_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (job_id) DO UPDATE
            SET fire_at = EXCLUDED.fire_at,
                claim_token = NULL,
                claimed_at = NULL,
                attempts = 0
            "#,
        )
        .bind(job.job_id())
        .bind(job.kind.as_str())
        .bind(&job.workflow_id)
        .bind(&job.transaction_id)
        .bind(&job.step_id)
        .bind(job.fire_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to schedule job"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self, job_id: &str) -> Result<(), StoreError> {
        // A job already claimed is being delivered; its run() sees the
        // persisted state and the ack removes it
        sqlx::query("DELETE FROM saga_scheduled_jobs WHERE job_id = $1 AND claim_token IS NULL")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to clear job"))?;
        Ok(())
    }

    fn attach_scheduler(&self, jobs: JobSender) {
        *self.jobs.write() = Some(jobs);
    }

    async fn start_scheduler(&self, shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let sender = self
            .jobs
            .read()
            .clone()
            .ok_or_else(|| StoreError::Scheduler("no scheduler attached".to_string()))?;

        let mut handle = self.poll_handle.lock();
        if handle.is_some() {
            return Ok(());
        }

        let source: Arc<dyn JobSource> = Arc::new(self.clone());
        *handle = Some(spawn_poll_loop(
            source,
            sender,
            self.config.poller.clone(),
            shutdown,
        ));
        info!("Started scheduled job poller");
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.job_id()))]
    async fn ack_job(&self, job: &ScheduledJob) -> Result<(), StoreError> {
        let Some(token) = job.claim_token else {
            return Ok(());
        };
        sqlx::query("DELETE FROM saga_scheduled_jobs WHERE job_id = $1 AND claim_token = $2")
            .bind(job.job_id())
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to acknowledge job"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "DELETE FROM saga_checkpoints WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to purge checkpoints"))?;

        let records = self.execution_log.purge_expired().await?;
        Ok(result.rows_affected() as usize + records)
    }
}

#[async_trait]
impl JobSource for PostgresCheckpointStorage {
    async fn claim_due_jobs(&self, limit: usize) -> Result<Vec<ScheduledJob>, StoreError> {
        let now = Utc::now();
        let lease_expired_before = now - to_chrono(self.config.job_lease);
        let token = Uuid::now_v7();

        // Claim due jobs that are unclaimed or whose lease ran out
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT job_id
                FROM saga_scheduled_jobs
                WHERE fire_at <= $1
                  AND (claimed_at IS NULL OR claimed_at <= $2)
                ORDER BY fire_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE saga_scheduled_jobs j
            SET claim_token = $4,
                claimed_at = $1,
                attempts = j.attempts + 1
            FROM due
            WHERE j.job_id = due.job_id
            RETURNING j.kind, j.workflow_id, j.transaction_id, j.step_id, j.fire_at, j.claim_token
            "#,
        )
        .bind(now)
        .bind(lease_expired_before)
        .bind(limit as i64)
        .bind(token)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to claim jobs"))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("kind");
            claimed.push(ScheduledJob {
                kind: kind.parse::<JobKind>().map_err(StoreError::Serialization)?,
                workflow_id: row.get("workflow_id"),
                transaction_id: row.get("transaction_id"),
                step_id: row.get("step_id"),
                fire_at: row.get("fire_at"),
                claim_token: row.get("claim_token"),
            });
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }
}

/// PostgreSQL execution log (`saga_workflow_executions`)
#[derive(Clone)]
pub struct PostgresExecutionLog {
    pool: PgPool,
}

impl PostgresExecutionLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_state(state: &str) -> Result<TransactionState, StoreError> {
    serde_json::from_value(serde_json::Value::String(state.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown transaction state: {state}")))
}

#[async_trait]
impl ExecutionLog for PostgresExecutionLog {
    #[instrument(skip(self, record), fields(workflow_id = %record.workflow_id, transaction_id = %record.transaction_id))]
    async fn upsert(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let context = serde_json::to_value(&record.context)?;

        sqlx::query(
            r#"
            INSERT INTO saga_workflow_executions
                (workflow_id, transaction_id, execution, context, state, retention_time_ms, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workflow_id, transaction_id) DO UPDATE
            SET execution = EXCLUDED.execution,
                context = EXCLUDED.context,
                state = EXCLUDED.state,
                retention_time_ms = EXCLUDED.retention_time_ms,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.workflow_id)
        .bind(&record.transaction_id)
        .bind(&record.execution)
        .bind(&context)
        .bind(record.state.to_string())
        .bind(record.retention_time.map(|d| d.as_millis() as i64))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to upsert execution"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, workflow_id: &str, transaction_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "DELETE FROM saga_workflow_executions WHERE workflow_id = $1 AND transaction_id = $2",
        )
        .bind(workflow_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to delete execution"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, transaction_id, execution, context, state, retention_time_ms, updated_at
            FROM saga_workflow_executions
            WHERE workflow_id = $1 AND transaction_id = $2
            "#,
        )
        .bind(workflow_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load execution"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let context: ExecutionContext = serde_json::from_value(row.get("context"))?;
        let state: String = row.get("state");
        let retention_ms: Option<i64> = row.get("retention_time_ms");

        Ok(Some(ExecutionRecord {
            workflow_id: row.get("workflow_id"),
            transaction_id: row.get("transaction_id"),
            execution: row.get("execution"),
            context,
            state: parse_state(&state)?,
            retention_time: retention_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
            updated_at: row.get("updated_at"),
        }))
    }

    #[instrument(skip(self))]
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM saga_workflow_executions
            WHERE retention_time_ms IS NOT NULL
              AND state IN ('done', 'failed', 'reverted')
              AND updated_at + retention_time_ms * INTERVAL '1 millisecond' <= NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to purge executions"))?;

        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PostgresStorageConfig::default();
        assert_eq!(config.job_lease, Duration::from_secs(30));
        assert_eq!(config.completed_ttl, Duration::from_secs(900));
    }

    #[test]
    fn test_config_builder() {
        let config = PostgresStorageConfig::default()
            .with_job_lease(Duration::from_secs(5))
            .with_completed_ttl(Duration::from_secs(60))
            .with_poller(PollerConfig::new().with_batch_size(4));
        assert_eq!(config.job_lease, Duration::from_secs(5));
        assert_eq!(config.completed_ttl, Duration::from_secs(60));
        assert_eq!(config.poller.batch_size, 4);
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("reverted").unwrap(), TransactionState::Reverted);
        assert!(parse_state("exploded").is_err());
    }
}
