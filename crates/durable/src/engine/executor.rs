//! Saga orchestrator
//!
//! The `WorkflowOrchestrator` is responsible for:
//! - Starting and resuming transactions of registered workflows
//! - Running ready steps concurrently and recording their outcomes
//! - Retrying, timing out and compensating steps
//! - Accepting callbacks for asynchronous steps
//! - Re-entering transactions when scheduled jobs fire

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::OrchestratorConfig;
use super::events::{Event, ObserverSet, TransactionObserver};
use super::locks::TransactionLocks;
use super::planner;
use super::registry::{RegistryError, WorkflowRegistry};
use crate::duration_serde::to_chrono;
use crate::persistence::{CheckpointStorage, StoreError};
use crate::reliability::sleep_until;
use crate::scheduler::{DispatchError, JobDispatcher, JobReceiver, JobTarget, ScheduledJob};
use crate::step::{StepContext, StepError, StepErrorKind, StepResult, Services};
use crate::transaction::{
    checkpoint_key, HandlerType, IdempotencyKey, IdempotencyKeyError, StepState, StepStatus,
    TransactionCheckpoint, TransactionState, TransactionStepError, KEY_SEPARATOR,
};
use crate::workflow::{ContinueOnFailurePolicy, ResultSelector, WorkflowDefinition};

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// No live checkpoint for the transaction
    #[error("transaction {transaction_id} of workflow {workflow_id} not found")]
    TransactionNotFound {
        workflow_id: String,
        transaction_id: String,
    },

    #[error("invalid idempotency key: {0}")]
    InvalidIdempotencyKey(#[from] IdempotencyKeyError),

    /// Transaction ids must be non-empty and free of the key separator
    #[error("invalid transaction id: '{0}'")]
    InvalidTransactionId(String),

    /// A persisted transaction references a step the workflow no longer has
    #[error("transaction {transaction_id} of workflow {workflow_id} references unknown step {step_id}")]
    DefinitionMismatch {
        workflow_id: String,
        transaction_id: String,
        step_id: String,
    },

    /// The transaction ended failed or reverted and the caller asked to raise
    #[error("transaction {transaction_id} of workflow {workflow_id} ended {state}: {}", summarize(.errors))]
    TransactionFailed {
        workflow_id: String,
        transaction_id: String,
        state: TransactionState,
        errors: Vec<TransactionStepError>,
    },

    /// The orchestrator no longer accepts new transactions
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

fn summarize(errors: &[TransactionStepError]) -> String {
    if errors.is_empty() {
        return "no errors recorded".to_string();
    }
    errors
        .iter()
        .map(|e| format!("{} ({}): {}", e.action, e.handler_type, e.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Options of a `run` call
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Resume or create this transaction; a UUIDv7 is generated when absent
    pub transaction_id: Option<String>,

    /// Workflow input, ignored when resuming
    pub input: Value,

    /// Caller metadata handed to every handler, ignored when resuming
    pub context: Value,

    /// Return [`ExecutorError::TransactionFailed`] when the transaction ends
    /// failed or reverted
    pub throw_on_error: bool,

    /// Overrides the workflow's result selector
    pub result_from: Option<ResultSelector>,

    /// Observers for this call only
    pub events: Vec<Arc<dyn TransactionObserver>>,
}

impl RunOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn throw_on_error(mut self) -> Self {
        self.throw_on_error = true;
        self
    }

    pub fn with_result_from(mut self, selector: impl Into<ResultSelector>) -> Self {
        self.result_from = Some(selector.into());
        self
    }

    pub fn with_events(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.events.push(observer);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("transaction_id", &self.transaction_id)
            .field("input", &self.input)
            .field("context", &self.context)
            .field("throw_on_error", &self.throw_on_error)
            .field("result_from", &self.result_from)
            .field("events", &self.events.len())
            .finish()
    }
}

/// Options of `register_step_success` / `register_step_failure`
#[derive(Clone, Default)]
pub struct CallbackOptions {
    pub throw_on_error: bool,
    pub result_from: Option<ResultSelector>,
    pub events: Vec<Arc<dyn TransactionObserver>>,
}

impl CallbackOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throw_on_error(mut self) -> Self {
        self.throw_on_error = true;
        self
    }

    pub fn with_result_from(mut self, selector: impl Into<ResultSelector>) -> Self {
        self.result_from = Some(selector.into());
        self
    }

    pub fn with_events(mut self, observer: Arc<dyn TransactionObserver>) -> Self {
        self.events.push(observer);
        self
    }
}

impl fmt::Debug for CallbackOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackOptions")
            .field("throw_on_error", &self.throw_on_error)
            .field("result_from", &self.result_from)
            .field("events", &self.events.len())
            .finish()
    }
}

/// Outcome of driving a transaction as far as it can go
#[derive(Debug, Clone)]
pub struct WorkflowResult {
    /// Snapshot after the call
    pub transaction: TransactionCheckpoint,

    /// Output picked by the result selector from the steps done so far
    pub result: Option<Value>,

    /// Invoke errors recorded so far; compensation errors stay on the
    /// transaction
    pub errors: Vec<TransactionStepError>,
}

impl WorkflowResult {
    pub fn state(&self) -> TransactionState {
        self.transaction.state()
    }

    pub fn transaction_id(&self) -> &str {
        self.transaction.transaction_id()
    }
}

/// Durable saga orchestrator
///
/// Drives transactions of registered workflows through their step graph.
/// Every transition is persisted through the [`CheckpointStorage`] before
/// observers see it, so any node can resume a transaction from its last
/// checkpoint.
///
/// # Example
///
/// ```ignore
/// use sagaflow_durable::prelude::*;
///
/// let mut registry = WorkflowRegistry::new();
/// registry.register(order_workflow()?)?;
///
/// let orchestrator = Arc::new(WorkflowOrchestrator::new(
///     registry,
///     Arc::new(InMemoryCheckpointStorage::new()),
/// ));
/// orchestrator.start().await?;
///
/// let result = orchestrator
///     .run("order_placement", RunOptions::new(json!({ "sku": "A-1" })))
///     .await?;
/// ```
pub struct WorkflowOrchestrator {
    registry: Arc<WorkflowRegistry>,
    storage: Arc<dyn CheckpointStorage>,
    services: Services,
    config: OrchestratorConfig,
    observers: RwLock<Vec<Arc<dyn TransactionObserver>>>,
    locks: TransactionLocks,
    handler_slots: Arc<Semaphore>,
    active: DashMap<String, CancellationToken>,
    jobs_rx: Mutex<Option<JobReceiver>>,
    shutdown_tx: watch::Sender<bool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl WorkflowOrchestrator {
    /// Create an orchestrator with the default configuration
    pub fn new(registry: WorkflowRegistry, storage: Arc<dyn CheckpointStorage>) -> Self {
        Self::with_config(registry, storage, OrchestratorConfig::default())
    }

    /// Create an orchestrator with custom config
    pub fn with_config(
        registry: WorkflowRegistry,
        storage: Arc<dyn CheckpointStorage>,
        config: OrchestratorConfig,
    ) -> Self {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        storage.attach_scheduler(jobs_tx);
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            workflows = registry.len(),
            max_concurrent_handlers = config.max_concurrent_handlers,
            "created workflow orchestrator"
        );

        Self {
            registry: Arc::new(registry),
            storage,
            services: Services::default(),
            handler_slots: Arc::new(Semaphore::new(config.max_concurrent_handlers)),
            config,
            observers: RwLock::new(Vec::new()),
            locks: TransactionLocks::new(),
            active: DashMap::new(),
            jobs_rx: Mutex::new(Some(jobs_rx)),
            shutdown_tx,
            dispatcher: Mutex::new(None),
        }
    }

    /// Services handed to every handler through its context
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    /// Add a process-wide observer
    pub fn subscribe(&self, observer: Arc<dyn TransactionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<dyn CheckpointStorage> {
        &self.storage
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Start delivering scheduled jobs (retries and timeouts)
    ///
    /// Jobs fired before `start` are buffered and delivered once it runs.
    pub async fn start(self: &Arc<Self>) -> Result<(), ExecutorError> {
        let Some(jobs) = self.jobs_rx.lock().take() else {
            debug!("orchestrator already started");
            return Ok(());
        };

        let target: Arc<dyn JobTarget> = self.clone();
        let dispatcher = JobDispatcher::new(
            Arc::downgrade(&target),
            Arc::clone(&self.storage),
            self.config.dispatch_retry.clone(),
            self.shutdown_tx.subscribe(),
        );
        *self.dispatcher.lock() = Some(dispatcher.spawn(jobs));

        self.storage
            .start_scheduler(self.shutdown_tx.subscribe())
            .await?;

        info!("orchestrator started");
        Ok(())
    }

    /// Stop accepting transactions and stop the scheduler
    ///
    /// Transactions being driven finish their current call.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("dispatcher task ended abnormally: {}", e);
            }
        }
        info!("orchestrator stopped");
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start a transaction, or resume it when `transaction_id` exists
    #[instrument(skip(self, options), fields(transaction_id = ?options.transaction_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        options: RunOptions,
    ) -> Result<WorkflowResult, ExecutorError> {
        if self.is_shutting_down() {
            return Err(ExecutorError::ShuttingDown);
        }

        let definition = self.registry.get(workflow_id)?;
        let transaction_id = match options.transaction_id {
            Some(id) => validate_transaction_id(id)?,
            None => Uuid::now_v7().to_string(),
        };

        let observers = self.observer_set(options.events);
        let checkpoint = self
            .enter(
                &definition,
                &transaction_id,
                Some((options.input, options.context)),
                observers,
            )
            .await?;

        respond(
            &definition,
            checkpoint,
            options.throw_on_error,
            options.result_from.as_ref(),
        )
    }

    /// Complete a waiting asynchronous step
    ///
    /// A key whose step is no longer waiting (or whose transaction already
    /// finished) is ignored.
    #[instrument(skip(self, key, response, options), fields(key = %key))]
    pub async fn register_step_success(
        &self,
        key: &IdempotencyKey,
        response: Value,
        options: CallbackOptions,
    ) -> Result<WorkflowResult, ExecutorError> {
        self.resolve_callback(key, Ok(response), options).await
    }

    /// Fail a waiting asynchronous step
    ///
    /// The failure is subject to the step's retry policy.
    #[instrument(skip(self, key, error, options), fields(key = %key))]
    pub async fn register_step_failure(
        &self,
        key: &IdempotencyKey,
        error: StepError,
        options: CallbackOptions,
    ) -> Result<WorkflowResult, ExecutorError> {
        self.resolve_callback(key, Err(error), options).await
    }

    /// Cancel a running transaction
    ///
    /// Pending steps are failed and completed steps compensated. Cancelling a
    /// finished transaction returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<WorkflowResult, ExecutorError> {
        let definition = self.registry.get(workflow_id)?;
        let key = checkpoint_key(workflow_id, transaction_id);

        // Interrupt a call currently driving the transaction
        if let Some(token) = self.active.get(&key) {
            token.cancel();
        }

        let _guard = self.locks.acquire(&key).await;
        let checkpoint = self.load(&definition, &key, transaction_id).await?;
        if checkpoint.is_terminal() {
            return respond(&definition, checkpoint, false, None);
        }

        let observers = self.observer_set(Vec::new());
        let mut execution = Execution::new(self, &definition, checkpoint, observers);
        execution.emit(Event::Resume);
        if execution.checkpoint.state() == TransactionState::Invoking {
            execution.abort_transaction(AbortReason::Cancelled).await?;
        }
        let checkpoint = self.drive_tracked(&key, execution).await?;

        respond(&definition, checkpoint, false, None)
    }

    /// Load a transaction snapshot
    pub async fn get_transaction(
        &self,
        workflow_id: &str,
        transaction_id: &str,
    ) -> Result<Option<TransactionCheckpoint>, ExecutorError> {
        Ok(self
            .storage
            .get(&checkpoint_key(workflow_id, transaction_id))
            .await?)
    }

    /// All live transaction snapshots
    pub async fn list_transactions(&self) -> Result<Vec<TransactionCheckpoint>, ExecutorError> {
        Ok(self.storage.list().await?)
    }

    fn observer_set(&self, extra: Vec<Arc<dyn TransactionObserver>>) -> ObserverSet {
        let mut observers = self.observers.read().clone();
        observers.extend(extra);
        ObserverSet::new(observers)
    }

    async fn load(
        &self,
        definition: &WorkflowDefinition,
        key: &str,
        transaction_id: &str,
    ) -> Result<TransactionCheckpoint, ExecutorError> {
        let mut checkpoint =
            self.storage
                .get(key)
                .await?
                .ok_or_else(|| ExecutorError::TransactionNotFound {
                    workflow_id: definition.id().to_string(),
                    transaction_id: transaction_id.to_string(),
                })?;

        checkpoint
            .sync_with_definition(definition)
            .map_err(|step_id| ExecutorError::DefinitionMismatch {
                workflow_id: definition.id().to_string(),
                transaction_id: transaction_id.to_string(),
                step_id,
            })?;
        Ok(checkpoint)
    }

    /// Drive a transaction under its lock
    ///
    /// `create` carries the input and metadata of a new transaction; without
    /// it a missing transaction is an error.
    async fn enter(
        &self,
        definition: &WorkflowDefinition,
        transaction_id: &str,
        create: Option<(Value, Value)>,
        observers: ObserverSet,
    ) -> Result<TransactionCheckpoint, ExecutorError> {
        let key = checkpoint_key(definition.id(), transaction_id);
        let _guard = self.locks.acquire(&key).await;

        let existing = match self.load(definition, &key, transaction_id).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(ExecutorError::TransactionNotFound { .. }) if create.is_some() => None,
            Err(e) => return Err(e),
        };

        let mut execution = match existing {
            Some(checkpoint) => {
                if checkpoint.is_terminal() {
                    debug!(%key, state = %checkpoint.state(), "transaction already finished");
                    return Ok(checkpoint);
                }
                let mut execution = Execution::new(self, definition, checkpoint, observers);
                execution.emit(Event::Resume);
                execution
            }
            None => {
                let (input, metadata) = create.unwrap_or_default();
                let checkpoint =
                    TransactionCheckpoint::new(definition, transaction_id, input, metadata);
                let mut execution = Execution::new(self, definition, checkpoint, observers);
                execution.begin().await?;
                execution
            }
        };

        if execution.checkpoint.state() == TransactionState::NotStarted {
            execution.begin().await?;
        }

        self.drive_tracked(&key, execution).await
    }

    async fn resolve_callback(
        &self,
        key: &IdempotencyKey,
        outcome: StepResult,
        options: CallbackOptions,
    ) -> Result<WorkflowResult, ExecutorError> {
        let definition = self.registry.get(&key.workflow_id)?;
        let storage_key = checkpoint_key(&key.workflow_id, &key.transaction_id);
        let _guard = self.locks.acquire(&storage_key).await;

        let checkpoint = self
            .load(&definition, &storage_key, &key.transaction_id)
            .await?;

        let waiting = key.action == HandlerType::Invoke
            && checkpoint.state() == TransactionState::Invoking
            && checkpoint
                .step(&key.step_id)
                .map_or(false, |record| record.is_waiting());

        if !waiting {
            debug!(%key, state = %checkpoint.state(), "ignoring callback for step that is not waiting");
            return respond(
                &definition,
                checkpoint,
                options.throw_on_error,
                options.result_from.as_ref(),
            );
        }

        let observers = self.observer_set(options.events);
        let mut execution = Execution::new(self, &definition, checkpoint, observers);
        execution.emit(Event::Resume);
        match outcome {
            Ok(response) => execution.complete_step(&key.step_id, response).await?,
            Err(error) => execution.fail_step(&key.step_id, error).await?,
        }
        let checkpoint = self.drive_tracked(&storage_key, execution).await?;

        respond(
            &definition,
            checkpoint,
            options.throw_on_error,
            options.result_from.as_ref(),
        )
    }

    async fn drive_tracked(
        &self,
        key: &str,
        execution: Execution<'_>,
    ) -> Result<TransactionCheckpoint, ExecutorError> {
        self.active.insert(key.to_string(), execution.abort.clone());
        let result = execution.drive().await;
        self.active.remove(key);
        result
    }
}

impl fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("observers", &self.observers.read().len())
            .field("active", &self.active.len())
            .finish()
    }
}

#[async_trait]
impl JobTarget for WorkflowOrchestrator {
    async fn fire(&self, job: &ScheduledJob) -> Result<(), DispatchError> {
        debug!(job_id = %job.job_id(), "scheduled job fired");

        let definition = self
            .registry
            .get(&job.workflow_id)
            .map_err(|e| DispatchError::Rejected(e.to_string()))?;

        let observers = self.observer_set(Vec::new());
        match self
            .enter(&definition, &job.transaction_id, None, observers)
            .await
        {
            Ok(_) => Ok(()),
            Err(
                e @ (ExecutorError::TransactionNotFound { .. }
                | ExecutorError::DefinitionMismatch { .. }
                | ExecutorError::Registry(_)),
            ) => Err(DispatchError::Rejected(e.to_string())),
            Err(ExecutorError::Store(e)) if !e.is_transient() && !matches!(e, StoreError::ConcurrencyConflict { .. }) => {
                Err(DispatchError::Rejected(e.to_string()))
            }
            Err(e) => Err(DispatchError::Transient(e.to_string())),
        }
    }
}

fn validate_transaction_id(id: String) -> Result<String, ExecutorError> {
    if id.is_empty() || id.contains(KEY_SEPARATOR) {
        return Err(ExecutorError::InvalidTransactionId(id));
    }
    Ok(id)
}

fn respond(
    definition: &WorkflowDefinition,
    checkpoint: TransactionCheckpoint,
    throw_on_error: bool,
    result_from: Option<&ResultSelector>,
) -> Result<WorkflowResult, ExecutorError> {
    let state = checkpoint.state();
    if throw_on_error && matches!(state, TransactionState::Failed | TransactionState::Reverted) {
        return Err(ExecutorError::TransactionFailed {
            workflow_id: checkpoint.workflow_id().to_string(),
            transaction_id: checkpoint.transaction_id().to_string(),
            state,
            errors: checkpoint.errors,
        });
    }

    // Resolved whatever the state; unfinished steps resolve to nothing
    let result = result_from
        .or(definition.result_from())
        .and_then(|selector| selector.resolve(&checkpoint.context.invoke));
    let errors = checkpoint.errors_for(HandlerType::Invoke).cloned().collect();

    Ok(WorkflowResult {
        errors,
        result,
        transaction: checkpoint,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AbortReason {
    Timeout,
    Cancelled,
}

enum CompensationScope {
    All,
    Affected(BTreeSet<String>),
}

struct HandlerOutcome {
    step_id: String,
    action: HandlerType,
    attempt: u32,
    result: StepResult,
}

enum Wake {
    Outcome(HandlerOutcome),
    Deadline,
    Abort,
}

/// One call's worth of driving a transaction
struct Execution<'a> {
    orchestrator: &'a WorkflowOrchestrator,
    definition: &'a WorkflowDefinition,
    checkpoint: TransactionCheckpoint,
    observers: ObserverSet,
    input: Arc<Value>,
    metadata: Arc<Value>,
    inflight: FuturesUnordered<BoxFuture<'static, HandlerOutcome>>,
    running: HashMap<String, CancellationToken>,
    /// Cancelled by `cancel`; reaches invoke handlers only
    abort: CancellationToken,
    /// Parent of compensate handler tokens, untouched by an abort
    unwind: CancellationToken,
}

impl<'a> Execution<'a> {
    fn new(
        orchestrator: &'a WorkflowOrchestrator,
        definition: &'a WorkflowDefinition,
        checkpoint: TransactionCheckpoint,
        observers: ObserverSet,
    ) -> Self {
        Self {
            input: Arc::new(checkpoint.context.payload.clone()),
            metadata: Arc::new(checkpoint.context.metadata.clone()),
            orchestrator,
            definition,
            checkpoint,
            observers,
            inflight: FuturesUnordered::new(),
            running: HashMap::new(),
            abort: CancellationToken::new(),
            unwind: CancellationToken::new(),
        }
    }

    fn storage(&self) -> &dyn CheckpointStorage {
        self.orchestrator.storage.as_ref()
    }

    fn emit(&self, event: Event<'_>) {
        self.observers.emit(&self.checkpoint, event);
    }

    async fn save(&mut self) -> Result<(), ExecutorError> {
        let key = self.checkpoint.key();
        let ttl = self.checkpoint.flow.options.store_ttl;
        let version = self.storage().save(&key, &self.checkpoint, ttl).await?;
        self.checkpoint.version = version;
        Ok(())
    }

    /// Persist a new transaction and arm its deadline
    async fn begin(&mut self) -> Result<(), ExecutorError> {
        self.checkpoint.flow.state = TransactionState::Invoking;
        self.checkpoint.flow.started_at = Utc::now();
        self.save().await?;

        if let Some(timeout) = self.checkpoint.flow.options.timeout {
            self.storage()
                .schedule_transaction_timeout(&self.checkpoint, timeout)
                .await?;
        }

        info!(
            workflow_id = %self.checkpoint.workflow_id(),
            transaction_id = %self.checkpoint.transaction_id(),
            "transaction started"
        );
        self.emit(Event::Begin);
        Ok(())
    }

    async fn drive(mut self) -> Result<TransactionCheckpoint, ExecutorError> {
        loop {
            self.check_deadlines().await?;

            let progressed = match self.checkpoint.state() {
                TransactionState::Invoking => self.advance_forward().await?,
                TransactionState::Compensating => self.advance_compensation().await?,
                _ => false,
            };

            if self.checkpoint.is_terminal() {
                break;
            }
            if progressed {
                continue;
            }

            if self.inflight.is_empty() {
                if self.try_finish().await? {
                    continue;
                }
                // Waiting on a scheduled retry or an async callback
                debug!(
                    transaction_id = %self.checkpoint.transaction_id(),
                    state = %self.checkpoint.state(),
                    "transaction suspended"
                );
                break;
            }

            match self.wait().await {
                Wake::Outcome(outcome) => self.handle_outcome(outcome).await?,
                Wake::Deadline => {}
                Wake::Abort => self.abort_transaction(AbortReason::Cancelled).await?,
            }
        }

        Ok(self.checkpoint)
    }

    async fn wait(&mut self) -> Wake {
        let wakeup = planner::next_wakeup(self.definition, &self.checkpoint);
        let invoking = self.checkpoint.state() == TransactionState::Invoking;
        let abort = self.abort.clone();

        tokio::select! {
            Some(outcome) = self.inflight.next() => Wake::Outcome(outcome),
            _ = sleep_until(wakeup) => Wake::Deadline,
            _ = abort.cancelled(), if invoking => Wake::Abort,
        }
    }

    async fn check_deadlines(&mut self) -> Result<(), ExecutorError> {
        if self.checkpoint.state() != TransactionState::Invoking {
            return Ok(());
        }

        let now = Utc::now();
        if let Some(deadline) = self.checkpoint.deadline() {
            if deadline.is_expired_at(now) {
                return self.abort_transaction(AbortReason::Timeout).await;
            }
        }

        for step_id in planner::expired_waiting_steps(self.definition, &self.checkpoint, now) {
            let limit = self
                .definition
                .step(&step_id)
                .and_then(|step| step.timeout())
                .unwrap_or_default();
            warn!(%step_id, "async step timed out awaiting its callback");
            self.emit(Event::Timeout(Some(&step_id)));
            self.fail_step(&step_id, StepError::step_timeout(&step_id, limit))
                .await?;
            if self.checkpoint.state() != TransactionState::Invoking {
                break;
            }
        }
        Ok(())
    }

    /// Skip unreachable steps and start ready ones
    async fn advance_forward(&mut self) -> Result<bool, ExecutorError> {
        let now = Utc::now();
        let running = &self.running;
        let plan = planner::resolve_pending(self.definition, &mut self.checkpoint, now, |id| {
            running.contains_key(id)
        });

        if plan.ready.is_empty() && plan.skipped.is_empty() {
            return Ok(false);
        }

        let mut retries_to_clear = Vec::new();
        for step_id in &plan.ready {
            if let Some(record) = self.checkpoint.step_mut(step_id) {
                if record.is_retry_pending() {
                    retries_to_clear.push(step_id.clone());
                }
                record.state = StepState::Invoking;
                record.status = StepStatus::Idle;
                record.attempts += 1;
                record.last_attempt_at = Some(now);
                record.next_attempt_at = None;
            }
        }
        self.save().await?;

        for step_id in &retries_to_clear {
            self.storage().clear_retry(&self.checkpoint, step_id).await?;
        }
        for step_id in &plan.skipped {
            debug!(%step_id, "step skipped");
            self.emit(Event::StepSkipped(step_id));
        }
        for step_id in &plan.ready {
            self.emit(Event::StepBegin(step_id));
            self.spawn_handler(step_id, HandlerType::Invoke);
        }

        Ok(true)
    }

    /// Start compensations whose successors have been unwound
    async fn advance_compensation(&mut self) -> Result<bool, ExecutorError> {
        let running = &self.running;
        let ready =
            planner::compensation_ready(self.definition, &self.checkpoint, |id| running.contains_key(id));
        if ready.is_empty() {
            return Ok(false);
        }

        let now = Utc::now();
        let mut instant = Vec::new();
        let mut spawn = Vec::new();
        for step_id in ready {
            let has_handler = self
                .definition
                .step(&step_id)
                .map_or(false, |step| step.has_compensation());
            let Some(record) = self.checkpoint.step_mut(&step_id) else {
                continue;
            };

            if has_handler {
                record.state = StepState::Compensating;
                record.status = StepStatus::Idle;
                record.compensation_attempts += 1;
                record.last_attempt_at = Some(now);
                spawn.push(step_id);
            } else {
                record.state = StepState::Reverted;
                record.status = StepStatus::Ok;
                record.compensated = true;
                instant.push(step_id);
            }
        }
        self.save().await?;

        for step_id in &instant {
            self.emit(Event::CompensateStepSuccess(step_id));
        }
        for step_id in &spawn {
            self.spawn_handler(step_id, HandlerType::Compensate);
        }

        Ok(true)
    }

    fn spawn_handler(&mut self, step_id: &str, action: HandlerType) {
        let definition = self.definition;
        let Some(step) = definition.step(step_id) else {
            return;
        };
        let Some(record) = self.checkpoint.step(step_id) else {
            return;
        };

        let (handler, attempt, limit) = match action {
            HandlerType::Invoke => (step.invoke_handler().clone(), record.attempts, step.timeout()),
            HandlerType::Compensate => match step.compensate_handler() {
                Some(handler) => (handler.clone(), record.compensation_attempts, None),
                None => return,
            },
        };

        let token = match action {
            HandlerType::Invoke => self.abort.child_token(),
            HandlerType::Compensate => self.unwind.child_token(),
        };
        let ctx = StepContext::new(
            self.checkpoint.idempotency_key(step_id, action),
            attempt,
            step.retry_policy().max_retries,
        )
        .with_input(Arc::clone(&self.input))
        .with_outputs(Arc::new(self.checkpoint.context.invoke.clone()))
        .with_metadata(Arc::clone(&self.metadata))
        .with_services(self.orchestrator.services.clone())
        .with_cancellation(token.clone());

        let slots = Arc::clone(&self.orchestrator.handler_slots);
        let owned_step_id = step_id.to_string();
        let handler_token = token.clone();

        let outcome = async move {
            let permit = slots.acquire_owned().await.ok();
            let task = tokio::spawn(async move {
                let _permit = permit;
                handler.call(ctx).await
            });

            let result = match limit {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        // The handler keeps running detached until it
                        // observes its cancellation token
                        handler_token.cancel();
                        Err(StepError::step_timeout(&owned_step_id, limit))
                    }
                },
                None => flatten(task.await),
            };

            HandlerOutcome {
                step_id: owned_step_id,
                action,
                attempt,
                result,
            }
        }
        .boxed();

        self.running.insert(step_id.to_string(), token);
        self.inflight.push(outcome);
    }

    async fn handle_outcome(&mut self, outcome: HandlerOutcome) -> Result<(), ExecutorError> {
        let HandlerOutcome {
            step_id,
            action,
            attempt,
            result,
        } = outcome;
        self.running.remove(&step_id);

        let Some(record) = self.checkpoint.step(&step_id) else {
            return Ok(());
        };
        let current = match action {
            HandlerType::Invoke => {
                record.state == StepState::Invoking
                    && record.status == StepStatus::Idle
                    && record.attempts == attempt
            }
            HandlerType::Compensate => {
                record.state == StepState::Compensating
                    && record.status == StepStatus::Idle
                    && record.compensation_attempts == attempt
            }
        };
        if !current {
            debug!(%step_id, %action, attempt, "discarding stale handler outcome");
            return Ok(());
        }

        let is_async = self
            .definition
            .step(&step_id)
            .map_or(false, |step| step.is_async());

        match (action, result) {
            (HandlerType::Invoke, Ok(_)) if is_async => self.await_callback(&step_id).await,
            (HandlerType::Invoke, Ok(output)) => self.complete_step(&step_id, output).await,
            (HandlerType::Invoke, Err(error)) => {
                if error.kind == StepErrorKind::StepTimeout {
                    self.emit(Event::Timeout(Some(&step_id)));
                }
                self.fail_step(&step_id, error).await
            }
            (HandlerType::Compensate, Ok(output)) => {
                self.complete_compensation(&step_id, output).await
            }
            (HandlerType::Compensate, Err(error)) => {
                self.fail_compensation(&step_id, error).await
            }
        }
    }

    /// An async step's handler submitted its work
    async fn await_callback(&mut self, step_id: &str) -> Result<(), ExecutorError> {
        let compensating = self.checkpoint.state() == TransactionState::Compensating;
        let timeout = self.definition.step(step_id).and_then(|step| step.timeout());
        let Some(record) = self.checkpoint.step_mut(step_id) else {
            return Ok(());
        };

        if compensating {
            // Work was submitted after the unwind began; revert it
            record.state = StepState::Failed;
            record.status = StepStatus::PermanentFailure;
            record.compensate_on_revert = true;
            self.save().await?;
            return Ok(());
        }

        record.status = StepStatus::Waiting;
        let started = record.last_attempt_at.unwrap_or_else(Utc::now);
        self.save().await?;

        if let Some(timeout) = timeout {
            let remaining = (started + to_chrono(timeout) - Utc::now())
                .to_std()
                .unwrap_or_default();
            self.storage()
                .schedule_step_timeout(&self.checkpoint, step_id, remaining)
                .await?;
        }

        debug!(%step_id, "step awaiting callback");
        self.emit(Event::StepAwaiting(step_id));
        Ok(())
    }

    /// Record a step's output; it is done once the snapshot is saved
    async fn complete_step(&mut self, step_id: &str, output: Value) -> Result<(), ExecutorError> {
        let compensating = self.checkpoint.state() == TransactionState::Compensating;
        let awaited = self
            .definition
            .step(step_id)
            .map_or(false, |step| step.is_async() && step.timeout().is_some());

        self.checkpoint
            .context
            .invoke
            .insert(step_id.to_string(), output.clone());
        if let Some(record) = self.checkpoint.step_mut(step_id) {
            record.state = StepState::Done;
            record.status = StepStatus::Ok;
            record.next_attempt_at = None;
            if compensating {
                record.compensate_on_revert = true;
            }
        }
        self.save().await?;

        if awaited {
            self.storage()
                .clear_step_timeout(&self.checkpoint, step_id)
                .await?;
        }

        debug!(%step_id, "step done");
        self.emit(Event::StepSuccess(step_id, &output));
        Ok(())
    }

    /// Record a failed attempt: retry it, or fail the step for good
    async fn fail_step(&mut self, step_id: &str, error: StepError) -> Result<(), ExecutorError> {
        let definition = self.definition;
        let Some(step) = definition.step(step_id) else {
            return Ok(());
        };
        let policy = step.retry_policy().clone();
        let continues = step.continues_on_permanent_failure();
        let awaited = step.is_async() && step.timeout().is_some();
        let compensating = self.checkpoint.state() == TransactionState::Compensating;
        let now = Utc::now();

        let Some(record) = self.checkpoint.step_mut(step_id) else {
            return Ok(());
        };
        record.failures += 1;
        record.last_error = Some(error.clone());
        if error.is_timeout() {
            record.compensate_on_revert = true;
        }
        let failures = record.failures;

        let retry = !error.permanent && !compensating && policy.has_retries_remaining(failures);
        if retry {
            let delay = policy.delay_for_retry(failures);
            record.status = StepStatus::TemporaryFailure;
            record.next_attempt_at = Some(now + to_chrono(delay));
            self.save().await?;

            if awaited {
                self.storage()
                    .clear_step_timeout(&self.checkpoint, step_id)
                    .await?;
            }
            if !delay.is_zero() {
                self.storage()
                    .schedule_retry(&self.checkpoint, step_id, delay)
                    .await?;
            }

            warn!(%step_id, failures, delay_ms = delay.as_millis() as u64, "step failed, retrying: {}", error);
            self.emit(Event::StepFailure(step_id, &error));
            return Ok(());
        }

        record.state = if error.kind == StepErrorKind::StepTimeout {
            StepState::TimedOut
        } else {
            StepState::Failed
        };
        record.status = StepStatus::PermanentFailure;
        record.next_attempt_at = None;

        let recorded = if failures > 1 {
            StepError::exhausted(step_id, failures, &error)
        } else {
            error.clone()
        };
        self.checkpoint
            .push_error(step_id, HandlerType::Invoke, recorded);
        self.checkpoint.flow.has_failed_steps = true;
        self.save().await?;

        if awaited {
            self.storage()
                .clear_step_timeout(&self.checkpoint, step_id)
                .await?;
        }

        error!(%step_id, failures, "step failed permanently: {}", error);
        self.emit(Event::StepFailure(step_id, &error));

        if !compensating && !continues {
            self.begin_compensation(CompensationScope::All).await?;
        }
        Ok(())
    }

    async fn complete_compensation(
        &mut self,
        step_id: &str,
        output: Value,
    ) -> Result<(), ExecutorError> {
        self.checkpoint
            .context
            .compensate
            .insert(step_id.to_string(), output);
        if let Some(record) = self.checkpoint.step_mut(step_id) {
            record.state = StepState::Reverted;
            record.status = StepStatus::Ok;
            record.compensated = true;
        }
        self.save().await?;

        debug!(%step_id, "step compensated");
        self.emit(Event::CompensateStepSuccess(step_id));
        Ok(())
    }

    /// Retry a failed compensation immediately, or record it and move on
    async fn fail_compensation(&mut self, step_id: &str, error: StepError) -> Result<(), ExecutorError> {
        let policy = self
            .definition
            .step(step_id)
            .map(|step| step.retry_policy().clone())
            .unwrap_or_default();
        let Some(record) = self.checkpoint.step_mut(step_id) else {
            return Ok(());
        };
        record.last_error = Some(error.clone());

        if !error.permanent && policy.has_retries_remaining(record.compensation_attempts) {
            record.status = StepStatus::TemporaryFailure;
            self.save().await?;
            warn!(%step_id, "compensation failed, retrying: {}", error);
        } else {
            record.state = StepState::Failed;
            record.status = StepStatus::PermanentFailure;
            record.compensated = true;
            self.checkpoint.push_error(
                step_id,
                HandlerType::Compensate,
                StepError::compensation(step_id, &error),
            );
            self.save().await?;
            error!(%step_id, "compensation failed permanently: {}", error);
        }

        self.emit(Event::CompensateStepFailure(step_id, &error));
        Ok(())
    }

    /// Switch the transaction to unwinding
    async fn begin_compensation(&mut self, scope: CompensationScope) -> Result<(), ExecutorError> {
        self.checkpoint.flow.state = TransactionState::Compensating;

        let definition = self.definition;
        let mut retries_to_clear = Vec::new();
        let mut timeouts_to_clear = Vec::new();
        for step in definition.steps() {
            let id = step.id();
            let running = self.running.contains_key(id);
            let Some(record) = self.checkpoint.step_mut(id) else {
                continue;
            };

            match record.state {
                StepState::Done => {
                    record.compensate_on_revert = match &scope {
                        CompensationScope::All => true,
                        CompensationScope::Affected(affected) => affected.contains(id),
                    };
                }
                StepState::Invoking if record.status == StepStatus::Waiting => {
                    record.state = StepState::Failed;
                    record.status = StepStatus::PermanentFailure;
                    record.compensate_on_revert = true;
                    if step.timeout().is_some() {
                        timeouts_to_clear.push(id.to_string());
                    }
                }
                StepState::Invoking if record.status == StepStatus::TemporaryFailure => {
                    // The failed attempt left nothing behind unless it timed out
                    record.state = StepState::Failed;
                    record.status = StepStatus::PermanentFailure;
                    record.next_attempt_at = None;
                    retries_to_clear.push(id.to_string());
                }
                StepState::Invoking if !running => {
                    record.state = StepState::Failed;
                    record.status = StepStatus::PermanentFailure;
                    record.compensate_on_revert = true;
                }
                StepState::NotStarted => {
                    record.state = StepState::Skipped;
                    self.checkpoint.flow.has_skipped_steps = true;
                }
                _ => {}
            }
        }
        self.save().await?;

        for step_id in &retries_to_clear {
            self.storage().clear_retry(&self.checkpoint, step_id).await?;
        }
        for step_id in &timeouts_to_clear {
            self.storage()
                .clear_step_timeout(&self.checkpoint, step_id)
                .await?;
        }

        info!(
            transaction_id = %self.checkpoint.transaction_id(),
            partial = self.checkpoint.flow.partial_compensation,
            "compensating transaction"
        );
        self.emit(Event::CompensateBegin);
        Ok(())
    }

    /// Fail everything still pending after a deadline or cancellation
    async fn abort_transaction(&mut self, reason: AbortReason) -> Result<(), ExecutorError> {
        if self.checkpoint.state() != TransactionState::Invoking {
            return Ok(());
        }

        let error = match reason {
            AbortReason::Timeout => StepError::transaction_timeout(
                self.checkpoint.flow.options.timeout.unwrap_or_default(),
            ),
            AbortReason::Cancelled => StepError::cancelled("transaction cancelled"),
        };

        // Drop in-flight handlers; their results are discarded
        self.inflight = FuturesUnordered::new();
        for (_, token) in self.running.drain() {
            token.cancel();
        }

        let definition = self.definition;
        let mut retries_to_clear = Vec::new();
        let mut timeouts_to_clear = Vec::new();
        for step in definition.steps() {
            let id = step.id();
            let Some(record) = self.checkpoint.step_mut(id) else {
                continue;
            };
            if record.state != StepState::Invoking {
                continue;
            }

            let retry_pending = record.is_retry_pending();
            if retry_pending {
                retries_to_clear.push(id.to_string());
            }
            if record.is_waiting() && step.timeout().is_some() {
                timeouts_to_clear.push(id.to_string());
            }

            record.state = match reason {
                AbortReason::Timeout => StepState::TimedOut,
                AbortReason::Cancelled => StepState::Failed,
            };
            record.status = StepStatus::PermanentFailure;
            record.next_attempt_at = None;
            record.last_error = Some(error.clone());
            if !retry_pending {
                record.compensate_on_revert = true;
            }
            self.checkpoint
                .push_error(id, HandlerType::Invoke, error.clone());
        }

        self.checkpoint.flow.has_failed_steps = true;
        match reason {
            AbortReason::Timeout => self.checkpoint.flow.timed_out = true,
            AbortReason::Cancelled => self.checkpoint.flow.cancelled = true,
        }

        for step_id in &retries_to_clear {
            self.storage().clear_retry(&self.checkpoint, step_id).await?;
        }
        for step_id in &timeouts_to_clear {
            self.storage()
                .clear_step_timeout(&self.checkpoint, step_id)
                .await?;
        }

        match reason {
            AbortReason::Timeout => {
                warn!(transaction_id = %self.checkpoint.transaction_id(), "transaction timed out");
                self.emit(Event::Timeout(None));
            }
            AbortReason::Cancelled => {
                info!(transaction_id = %self.checkpoint.transaction_id(), "transaction cancelled");
            }
        }

        self.begin_compensation(CompensationScope::All).await
    }

    /// Move to the next phase once nothing is in flight
    ///
    /// Returns whether the transaction state changed.
    async fn try_finish(&mut self) -> Result<bool, ExecutorError> {
        match self.checkpoint.state() {
            TransactionState::Invoking => {
                let unfinished = self.checkpoint.flow.steps.values().any(|record| {
                    matches!(record.state, StepState::NotStarted | StepState::Invoking)
                });
                if unfinished {
                    return Ok(false);
                }

                if !self.checkpoint.flow.has_failed_steps {
                    self.finalize(TransactionState::Done).await?;
                    return Ok(true);
                }

                let policy = self
                    .definition
                    .options()
                    .continue_on_failure
                    .unwrap_or(self.orchestrator.config.continue_on_failure);
                match policy {
                    ContinueOnFailurePolicy::FailWithoutCompensation => {
                        self.finalize(TransactionState::Failed).await?
                    }
                    ContinueOnFailurePolicy::CompensateAll => {
                        self.begin_compensation(CompensationScope::All).await?
                    }
                    ContinueOnFailurePolicy::CompensateAffected => {
                        let affected = planner::affected_steps(self.definition, &self.checkpoint);
                        self.checkpoint.flow.partial_compensation = true;
                        self.begin_compensation(CompensationScope::Affected(affected))
                            .await?
                    }
                }
                Ok(true)
            }
            TransactionState::Compensating => {
                let pending = self
                    .checkpoint
                    .flow
                    .steps
                    .values()
                    .any(|record| record.is_pending_compensation());
                if pending {
                    return Ok(false);
                }

                let state = if self.checkpoint.flow.partial_compensation {
                    TransactionState::Failed
                } else {
                    TransactionState::Reverted
                };
                self.finalize(state).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize(&mut self, state: TransactionState) -> Result<(), ExecutorError> {
        self.checkpoint.flow.state = state;
        self.checkpoint.flow.finished_at = Some(Utc::now());
        self.save().await?;

        if self.checkpoint.flow.options.timeout.is_some() {
            self.storage()
                .clear_transaction_timeout(&self.checkpoint)
                .await?;
        }

        info!(
            workflow_id = %self.checkpoint.workflow_id(),
            transaction_id = %self.checkpoint.transaction_id(),
            %state,
            errors = self.checkpoint.errors.len(),
            "transaction finished"
        );
        self.emit(Event::Finish);
        Ok(())
    }
}

fn flatten(joined: Result<StepResult, tokio::task::JoinError>) -> StepResult {
    joined.unwrap_or_else(|e| Err(StepError::new(format!("step handler panicked: {e}"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryCheckpointStorage;
    use crate::step::handler_fn;
    use crate::workflow::{StepDefinition, WorkflowBuilder};
    use serde_json::json;

    fn orchestrator(definition: WorkflowDefinition) -> WorkflowOrchestrator {
        let mut registry = WorkflowRegistry::new();
        registry.register(definition).unwrap();
        WorkflowOrchestrator::new(registry, Arc::new(InMemoryCheckpointStorage::new()))
    }

    #[test]
    fn test_validate_transaction_id() {
        assert!(validate_transaction_id("tx-1".to_string()).is_ok());
        assert!(matches!(
            validate_transaction_id("a:b".to_string()),
            Err(ExecutorError::InvalidTransactionId(_))
        ));
        assert!(validate_transaction_id(String::new()).is_err());
    }

    #[test]
    fn test_transaction_failed_message_lists_errors() {
        let err = ExecutorError::TransactionFailed {
            workflow_id: "wf".to_string(),
            transaction_id: "tx".to_string(),
            state: TransactionState::Reverted,
            errors: vec![TransactionStepError {
                action: "charge".to_string(),
                handler_type: HandlerType::Invoke,
                error: StepError::new("card declined"),
            }],
        };
        assert_eq!(
            err.to_string(),
            "transaction tx of workflow wf ended reverted: charge (invoke): card declined"
        );
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let def = WorkflowBuilder::new("wf")
            .step(StepDefinition::new("a", handler_fn(|_| async { Ok(json!(1)) })))
            .build()
            .unwrap();
        let orchestrator = orchestrator(def);

        let err = orchestrator
            .run("missing", RunOptions::new(Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Registry(RegistryError::UnknownWorkflow(_))));
    }

    #[tokio::test]
    async fn test_generated_transaction_id_and_result() {
        let def = WorkflowBuilder::new("wf")
            .step(StepDefinition::new("a", handler_fn(|ctx| async move {
                Ok(json!({ "echo": ctx.input()["n"] }))
            })))
            .result_from("a")
            .build()
            .unwrap();
        let orchestrator = orchestrator(def);

        let result = orchestrator
            .run("wf", RunOptions::new(json!({ "n": 7 })))
            .await
            .unwrap();

        assert_eq!(result.state(), TransactionState::Done);
        assert_eq!(result.result, Some(json!({ "echo": 7 })));
        assert!(Uuid::parse_str(result.transaction_id()).is_ok());
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_handler_panic_is_a_step_failure() {
        let def = WorkflowBuilder::new("wf")
            .step(StepDefinition::new(
                "boom",
                handler_fn(|_| async {
                    if true {
                        panic!("handler bug");
                    }
                    Ok(Value::Null)
                }),
            ))
            .build()
            .unwrap();
        let orchestrator = orchestrator(def);

        let result = orchestrator
            .run("wf", RunOptions::new(Value::Null))
            .await
            .unwrap();

        assert_eq!(result.state(), TransactionState::Reverted);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].error.message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_runs() {
        let def = WorkflowBuilder::new("wf")
            .step(StepDefinition::new("a", handler_fn(|_| async { Ok(Value::Null) })))
            .build()
            .unwrap();
        let orchestrator = Arc::new(orchestrator(def));
        orchestrator.start().await.unwrap();
        orchestrator.shutdown().await;

        let err = orchestrator
            .run("wf", RunOptions::new(Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ShuttingDown));
    }
}
