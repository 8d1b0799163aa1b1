//! Queryable record of transaction executions
//!
//! The checkpoint store holds the hot snapshot used to drive a transaction;
//! the execution log is the durable, queryable history kept for
//! `retention_time` after a transaction finishes.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::StoreError;
use crate::duration_serde::{option_millis, to_chrono};
use crate::transaction::{TransactionCheckpoint, TransactionState, TransactionStepError};

/// Data and errors of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionContext {
    pub data: Value,
    pub errors: Vec<TransactionStepError>,
}

/// One row of the execution log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub workflow_id: String,
    pub transaction_id: String,
    /// Serialized transaction flow
    pub execution: Value,
    pub context: ExecutionContext,
    pub state: TransactionState,
    #[serde(default, with = "option_millis")]
    pub retention_time: Option<Duration>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn from_checkpoint(checkpoint: &TransactionCheckpoint) -> Result<Self, StoreError> {
        Ok(Self {
            workflow_id: checkpoint.workflow_id().to_string(),
            transaction_id: checkpoint.transaction_id().to_string(),
            execution: serde_json::to_value(&checkpoint.flow)?,
            context: ExecutionContext {
                data: serde_json::to_value(&checkpoint.context)?,
                errors: checkpoint.errors.clone(),
            },
            state: checkpoint.state(),
            retention_time: checkpoint.flow.options.retention_time,
            updated_at: Utc::now(),
        })
    }

    /// A finished record whose retention has elapsed at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.retention_time {
            Some(retention) if self.state.is_terminal() => {
                self.updated_at + to_chrono(retention) <= now
            }
            _ => false,
        }
    }
}

/// Persistence of execution records
#[async_trait]
pub trait ExecutionLog: Send + Sync + 'static {
    async fn upsert(&self, record: ExecutionRecord) -> Result<(), StoreError>;

    async fn delete(&self, workflow_id: &str, transaction_id: &str) -> Result<(), StoreError>;

    async fn get(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Remove finished records whose retention has elapsed
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// In-memory execution log
#[derive(Debug, Default)]
pub struct InMemoryExecutionLog {
    records: RwLock<HashMap<(String, String), ExecutionRecord>>,
}

impl InMemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ExecutionLog for InMemoryExecutionLog {
    async fn upsert(&self, record: ExecutionRecord) -> Result<(), StoreError> {
        let key = (record.workflow_id.clone(), record.transaction_id.clone());
        self.records.write().insert(key, record);
        Ok(())
    }

    async fn delete(&self, workflow_id: &str, transaction_id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .remove(&(workflow_id.to_string(), transaction_id.to_string()));
        Ok(())
    }

    async fn get(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .get(&(workflow_id.to_string(), transaction_id.to_string()))
            .cloned())
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::handler_fn;
    use crate::workflow::{StepDefinition, WorkflowBuilder};

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
    async fn test_upsert_get_delete() {
        let log = InMemoryExecutionLog::new();
        let record = ExecutionRecord::from_checkpoint(&checkpoint(None)).unwrap();

        log.upsert(record.clone()).await.unwrap();
        assert_eq!(log.get("wf", "tx-1").await.unwrap(), Some(record));
        assert_eq!(log.len(), 1);

        log.delete("wf", "tx-1").await.unwrap();
        assert!(log.get("wf", "tx-1").await.unwrap().is_none());
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_retained_records() {
        let log = InMemoryExecutionLog::new();
        let mut cp = checkpoint(Some(Duration::from_millis(1)));
        cp.flow.state = TransactionState::Done;
        let mut record = ExecutionRecord::from_checkpoint(&cp).unwrap();
        record.updated_at = Utc::now() - chrono::Duration::seconds(1);
        log.upsert(record).await.unwrap();

        let mut running = ExecutionRecord::from_checkpoint(&checkpoint(None)).unwrap();
        running.transaction_id = "tx-2".to_string();
        log.upsert(running).await.unwrap();

        assert_eq!(log.purge_expired().await.unwrap(), 1);
        assert!(log.get("wf", "tx-2").await.unwrap().is_some());
    }
}
