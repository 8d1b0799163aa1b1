//! Transaction lifecycle observers
//!
//! Observers are called synchronously from the driving task right after the
//! corresponding transition has been persisted. They must not block.

use std::sync::Arc;

use serde_json::Value;

use crate::step::StepError;
use crate::transaction::TransactionCheckpoint;

/// Hooks into a transaction's lifecycle
///
/// Every method has an empty default so implementors only override what they
/// need.
///
/// # Example
///
/// ```ignore
/// struct AuditTrail;
///
/// impl TransactionObserver for AuditTrail {
///     fn on_finish(&self, checkpoint: &TransactionCheckpoint) {
///         info!(state = %checkpoint.state(), "transaction finished");
///     }
/// }
///
/// orchestrator.subscribe(Arc::new(AuditTrail));
/// ```
#[allow(unused_variables)]
pub trait TransactionObserver: Send + Sync {
    /// A new transaction started
    fn on_begin(&self, checkpoint: &TransactionCheckpoint) {}

    /// An existing transaction was re-entered
    fn on_resume(&self, checkpoint: &TransactionCheckpoint) {}

    fn on_step_begin(&self, checkpoint: &TransactionCheckpoint, step_id: &str) {}

    fn on_step_success(&self, checkpoint: &TransactionCheckpoint, step_id: &str, output: &Value) {}

    /// An invoke attempt failed (retry pending or not)
    fn on_step_failure(&self, checkpoint: &TransactionCheckpoint, step_id: &str, error: &StepError) {}

    /// An async step submitted its work and awaits a callback
    fn on_step_awaiting(&self, checkpoint: &TransactionCheckpoint, step_id: &str) {}

    fn on_step_skipped(&self, checkpoint: &TransactionCheckpoint, step_id: &str) {}

    /// The transaction started unwinding
    fn on_compensate_begin(&self, checkpoint: &TransactionCheckpoint) {}

    fn on_compensate_step_success(&self, checkpoint: &TransactionCheckpoint, step_id: &str) {}

    fn on_compensate_step_failure(
        &self,
        checkpoint: &TransactionCheckpoint,
        step_id: &str,
        error: &StepError,
    ) {
    }

    /// A step deadline (`Some(step_id)`) or the transaction deadline elapsed
    fn on_timeout(&self, checkpoint: &TransactionCheckpoint, step_id: Option<&str>) {}

    /// The transaction reached a terminal state
    fn on_finish(&self, checkpoint: &TransactionCheckpoint) {}
}

/// Event emitted by the engine, fanned out to observers
#[derive(Debug, Clone, Copy)]
pub(crate) enum Event<'a> {
    Begin,
    Resume,
    StepBegin(&'a str),
    StepSuccess(&'a str, &'a Value),
    StepFailure(&'a str, &'a StepError),
    StepAwaiting(&'a str),
    StepSkipped(&'a str),
    CompensateBegin,
    CompensateStepSuccess(&'a str),
    CompensateStepFailure(&'a str, &'a StepError),
    Timeout(Option<&'a str>),
    Finish,
}

/// Process-wide observers plus those passed to a single `run`
#[derive(Clone, Default)]
pub(crate) struct ObserverSet {
    observers: Vec<Arc<dyn TransactionObserver>>,
}

impl ObserverSet {
    pub(crate) fn new(observers: Vec<Arc<dyn TransactionObserver>>) -> Self {
        Self { observers }
    }

    pub(crate) fn emit(&self, checkpoint: &TransactionCheckpoint, event: Event<'_>) {
        for observer in &self.observers {
            match event {
                Event::Begin => observer.on_begin(checkpoint),
                Event::Resume => observer.on_resume(checkpoint),
                Event::StepBegin(step) => observer.on_step_begin(checkpoint, step),
                Event::StepSuccess(step, output) => {
                    observer.on_step_success(checkpoint, step, output)
                }
                Event::StepFailure(step, error) => {
                    observer.on_step_failure(checkpoint, step, error)
                }
                Event::StepAwaiting(step) => observer.on_step_awaiting(checkpoint, step),
                Event::StepSkipped(step) => observer.on_step_skipped(checkpoint, step),
                Event::CompensateBegin => observer.on_compensate_begin(checkpoint),
                Event::CompensateStepSuccess(step) => {
                    observer.on_compensate_step_success(checkpoint, step)
                }
                Event::CompensateStepFailure(step, error) => {
                    observer.on_compensate_step_failure(checkpoint, step, error)
                }
                Event::Timeout(step) => observer.on_timeout(checkpoint, step),
                Event::Finish => observer.on_finish(checkpoint),
            }
        }
    }
}
