//! Persisted transaction snapshot
//!
//! A [`TransactionCheckpoint`] is everything needed to resume a transaction
//! on any node: the flow (transaction and per-step state), the execution
//! context (input payload and handler outputs) and the accumulated errors.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::idempotency::{HandlerType, IdempotencyKey};
use super::state::{StepState, StepStatus, TransactionState};
use crate::duration_serde::option_millis;
use crate::reliability::Deadline;
use crate::step::StepError;
use crate::workflow::WorkflowDefinition;

/// Storage key of a transaction checkpoint
pub fn checkpoint_key(workflow_id: &str, transaction_id: &str) -> String {
    format!("saga:{workflow_id}:{transaction_id}")
}

/// Per-step runtime record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub id: String,
    pub state: StepState,
    pub status: StepStatus,

    /// Invoke attempts started
    pub attempts: u32,

    /// Invoke attempts that failed or timed out
    pub failures: u32,

    /// Compensate attempts started
    #[serde(default)]
    pub compensation_attempts: u32,

    pub last_error: Option<StepError>,

    /// The compensation phase finished for this step (successfully or not)
    #[serde(default)]
    pub compensated: bool,

    /// Must be compensated when the transaction reverts
    #[serde(default)]
    pub compensate_on_revert: bool,

    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: StepState::NotStarted,
            status: StepStatus::Idle,
            attempts: 0,
            failures: 0,
            compensation_attempts: 0,
            last_error: None,
            compensated: false,
            compensate_on_revert: false,
            last_attempt_at: None,
            next_attempt_at: None,
        }
    }

    /// Invoking with a retry pending
    pub fn is_retry_pending(&self) -> bool {
        self.state == StepState::Invoking && self.status == StepStatus::TemporaryFailure
    }

    /// Async step awaiting its external callback
    pub fn is_waiting(&self) -> bool {
        self.state == StepState::Invoking && self.status == StepStatus::Waiting
    }

    /// Marked for compensation but not yet through it
    pub fn is_pending_compensation(&self) -> bool {
        self.compensate_on_revert && !self.compensated
    }
}

/// Options captured from the workflow definition when the transaction began
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransactionOptions {
    #[serde(default, with = "option_millis")]
    pub retention_time: Option<Duration>,

    #[serde(default, with = "option_millis")]
    pub timeout: Option<Duration>,

    #[serde(default, with = "option_millis")]
    pub store_ttl: Option<Duration>,
}

/// Transaction-level state plus every step record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionFlow {
    pub model_id: String,
    pub transaction_id: String,
    pub state: TransactionState,
    pub steps: BTreeMap<String, StepRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub options: TransactionOptions,
    #[serde(default)]
    pub has_failed_steps: bool,
    #[serde(default)]
    pub has_skipped_steps: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub cancelled: bool,
    /// Only the steps affected by a tolerated failure are being unwound
    #[serde(default)]
    pub partial_compensation: bool,
}

/// Data flowing through the transaction
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TransactionContext {
    /// Input passed to `run`
    pub payload: Value,

    /// Outputs of invoke handlers by step id
    #[serde(default)]
    pub invoke: BTreeMap<String, Value>,

    /// Outputs of compensate handlers by step id
    #[serde(default)]
    pub compensate: BTreeMap<String, Value>,

    /// Caller-supplied metadata
    #[serde(default)]
    pub metadata: Value,
}

/// An error recorded against one handler of one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionStepError {
    /// Step id
    pub action: String,
    pub handler_type: HandlerType,
    pub error: StepError,
}

/// Serializable snapshot of a transaction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransactionCheckpoint {
    pub flow: TransactionFlow,
    pub context: TransactionContext,
    #[serde(default)]
    pub errors: Vec<TransactionStepError>,
    /// Optimistic concurrency version assigned by the storage
    #[serde(default)]
    pub version: u64,
}

impl TransactionCheckpoint {
    /// Fresh checkpoint for a new transaction of `definition`
    pub fn new(
        definition: &WorkflowDefinition,
        transaction_id: impl Into<String>,
        payload: Value,
        metadata: Value,
    ) -> Self {
        let options = definition.options();
        let steps = definition
            .steps()
            .iter()
            .map(|step| (step.id().to_string(), StepRecord::new(step.id())))
            .collect();

        Self {
            flow: TransactionFlow {
                model_id: definition.id().to_string(),
                transaction_id: transaction_id.into(),
                state: TransactionState::NotStarted,
                steps,
                started_at: Utc::now(),
                finished_at: None,
                options: TransactionOptions {
                    retention_time: options.retention_time,
                    timeout: options.timeout,
                    store_ttl: options.store_ttl,
                },
                has_failed_steps: false,
                has_skipped_steps: false,
                timed_out: false,
                cancelled: false,
                partial_compensation: false,
            },
            context: TransactionContext {
                payload,
                invoke: BTreeMap::new(),
                compensate: BTreeMap::new(),
                metadata,
            },
            errors: Vec::new(),
            version: 0,
        }
    }

    /// Reconcile a loaded checkpoint with the registered definition
    ///
    /// Steps added to the definition since the checkpoint was written are
    /// appended as not started. Returns the id of the first persisted step
    /// the definition no longer knows.
    pub fn sync_with_definition(&mut self, definition: &WorkflowDefinition) -> Result<(), String> {
        if let Some(unknown) = self
            .flow
            .steps
            .keys()
            .find(|id| definition.step(id).is_none())
        {
            return Err(unknown.clone());
        }
        for step in definition.steps() {
            self.flow
                .steps
                .entry(step.id().to_string())
                .or_insert_with(|| StepRecord::new(step.id()));
        }
        Ok(())
    }

    pub fn key(&self) -> String {
        checkpoint_key(&self.flow.model_id, &self.flow.transaction_id)
    }

    pub fn workflow_id(&self) -> &str {
        &self.flow.model_id
    }

    pub fn transaction_id(&self) -> &str {
        &self.flow.transaction_id
    }

    pub fn state(&self) -> TransactionState {
        self.flow.state
    }

    pub fn is_terminal(&self) -> bool {
        self.flow.state.is_terminal()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepRecord> {
        self.flow.steps.get(step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepRecord> {
        self.flow.steps.get_mut(step_id)
    }

    /// Idempotency key of one handler of a step in this transaction
    pub fn idempotency_key(&self, step_id: &str, action: HandlerType) -> IdempotencyKey {
        IdempotencyKey::new(
            self.flow.model_id.clone(),
            self.flow.transaction_id.clone(),
            step_id,
            action,
        )
    }

    /// Transaction deadline, when a timeout is configured
    pub fn deadline(&self) -> Option<Deadline> {
        self.flow
            .options
            .timeout
            .map(|timeout| Deadline::after(self.flow.started_at, timeout))
    }

    /// Errors recorded for one kind of handler
    pub fn errors_for(&self, handler_type: HandlerType) -> impl Iterator<Item = &TransactionStepError> {
        self.errors
            .iter()
            .filter(move |e| e.handler_type == handler_type)
    }

    /// Record an error against a step
    pub fn push_error(&mut self, step_id: &str, handler_type: HandlerType, error: StepError) {
        self.errors.push(TransactionStepError {
            action: step_id.to_string(),
            handler_type,
            error,
        });
    }

    /// Steps in a given state
    pub fn steps_in(&self, state: StepState) -> impl Iterator<Item = &StepRecord> {
        self.flow.steps.values().filter(move |s| s.state == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::handler_fn;
    use crate::workflow::{StepDefinition, WorkflowBuilder};

    fn definition() -> WorkflowDefinition {
        let noop = handler_fn(|_| async { Ok(Value::Null) });
        WorkflowBuilder::new("order")
            .step(StepDefinition::new("reserve", noop.clone()))
            .then(StepDefinition::new("charge", noop))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap()
    }

    #[test]
    fn test_checkpoint_key() {
        assert_eq!(checkpoint_key("order", "tx-1"), "saga:order:tx-1");
    }

    #[test]
    fn test_new_checkpoint() {
        let checkpoint =
            TransactionCheckpoint::new(&definition(), "tx-1", serde_json::json!({"a": 1}), Value::Null);

        assert_eq!(checkpoint.key(), "saga:order:tx-1");
        assert_eq!(checkpoint.state(), TransactionState::NotStarted);
        assert_eq!(checkpoint.flow.steps.len(), 2);
        assert_eq!(checkpoint.version, 0);
        assert_eq!(checkpoint.flow.options.timeout, Some(Duration::from_secs(30)));
        assert!(checkpoint.deadline().is_some());
        assert!(checkpoint
            .flow
            .steps
            .values()
            .all(|s| s.state == StepState::NotStarted));
    }

    #[test]
    fn test_sync_with_definition() {
        let def = definition();
        let mut checkpoint = TransactionCheckpoint::new(&def, "tx-1", Value::Null, Value::Null);
        checkpoint.flow.steps.remove("charge");
        assert!(checkpoint.sync_with_definition(&def).is_ok());
        assert!(checkpoint.step("charge").is_some());

        checkpoint
            .flow
            .steps
            .insert("ghost".to_string(), StepRecord::new("ghost"));
        assert_eq!(checkpoint.sync_with_definition(&def), Err("ghost".to_string()));
    }

    #[test]
    fn test_steps_in_state() {
        let mut checkpoint = TransactionCheckpoint::new(&definition(), "tx-1", Value::Null, Value::Null);
        if let Some(record) = checkpoint.step_mut("reserve") {
            record.state = StepState::Done;
        }

        let done: Vec<_> = checkpoint.steps_in(StepState::Done).map(|s| s.id.as_str()).collect();
        assert_eq!(done, vec!["reserve"]);
        assert_eq!(checkpoint.steps_in(StepState::NotStarted).count(), 1);
        assert_eq!(checkpoint.steps_in(StepState::Failed).count(), 0);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut checkpoint = TransactionCheckpoint::new(&definition(), "tx-1", Value::Null, Value::Null);
        checkpoint.push_error("charge", HandlerType::Invoke, StepError::new("declined"));
        checkpoint.version = 3;

        let json = serde_json::to_string(&checkpoint).unwrap();
        let parsed: TransactionCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, checkpoint);
        assert_eq!(parsed.errors_for(HandlerType::Invoke).count(), 1);
        assert_eq!(parsed.errors_for(HandlerType::Compensate).count(), 0);
    }
}
