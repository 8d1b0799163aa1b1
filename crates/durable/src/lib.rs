//! # Saga Orchestration Engine
//!
//! A durable coordinator for multi-step business transactions with
//! compensating rollback.
//!
//! ## Features
//!
//! - **Step graphs**: Steps declare their dependencies; independent steps run concurrently
//! - **Compensation**: Completed steps are undone in reverse dependency order when a transaction fails
//! - **Automatic retries**: Fixed or exponential backoff, inline or scheduled
//! - **Timeouts**: Per-step and per-transaction deadlines
//! - **Async steps**: Steps completed later by an external callback keyed by an idempotency key
//! - **Durable checkpoints**: In-memory or PostgreSQL, resumable on any node
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowOrchestrator                       │
//! │  (runs ready steps, records outcomes, drives compensation)  │
//! └─────────────────────────────────────────────────────────────┘
//!                │ save / get                  ▲ fired jobs
//!                ▼                             │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   CheckpointStorage                          │
//! │  (PostgreSQL: saga_checkpoints, scheduled_jobs, executions) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   JobDispatcher                              │
//! │  (re-enters transactions for retries and timeouts)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use sagaflow_durable::prelude::*;
//! use serde_json::json;
//!
//! let workflow = WorkflowBuilder::new("order_placement")
//!     .step(
//!         StepDefinition::new("reserve", handler_fn(reserve))
//!             .with_compensation(handler_fn(release)),
//!     )
//!     .then(
//!         StepDefinition::new("charge", handler_fn(charge))
//!             .with_retry(RetryPolicy::exponential().with_max_retries(3)),
//!     )
//!     .result_from("charge")
//!     .build()?;
//!
//! let mut registry = WorkflowRegistry::new();
//! registry.register(workflow)?;
//!
//! let orchestrator = Arc::new(WorkflowOrchestrator::new(
//!     registry,
//!     Arc::new(InMemoryCheckpointStorage::new()),
//! ));
//! orchestrator.start().await?;
//!
//! let result = orchestrator
//!     .run("order_placement", RunOptions::new(json!({ "sku": "A-1" })))
//!     .await?;
//! ```

pub(crate) mod duration_serde;

pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod scheduler;
pub mod step;
pub mod transaction;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        CallbackOptions, ExecutorError, OrchestratorConfig, RunOptions, TransactionObserver,
        WorkflowOrchestrator, WorkflowRegistry, WorkflowResult,
    };
    pub use crate::persistence::{
        CheckpointStorage, InMemoryCheckpointStorage, PostgresCheckpointStorage, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{handler_fn, Services, StepContext, StepError, StepHandler, StepResult};
    pub use crate::transaction::{
        HandlerType, IdempotencyKey, StepState, TransactionCheckpoint, TransactionState,
    };
    pub use crate::workflow::{
        ContinueOnFailurePolicy, OutputRef, ResultSelector, StepDefinition, WorkflowBuilder,
        WorkflowDefinition,
    };
}

// Re-export key types at crate root
pub use engine::{
    CallbackOptions, ExecutorError, OrchestratorConfig, RegistryError, RunOptions,
    TransactionObserver, WorkflowOrchestrator, WorkflowRegistry, WorkflowResult,
};
pub use persistence::{
    CheckpointStorage, ExecutionLog, InMemoryCheckpointStorage, InMemoryExecutionLog,
    PostgresCheckpointStorage, PostgresExecutionLog, PostgresStorageConfig, StoreError,
};
pub use reliability::{Deadline, RetryPolicy};
pub use step::{handler_fn, Handler, Services, StepContext, StepError, StepErrorKind, StepHandler};
pub use transaction::{
    HandlerType, IdempotencyKey, StepState, StepStatus, TransactionCheckpoint, TransactionState,
};
pub use workflow::{
    ContinueOnFailurePolicy, DefinitionError, OutputRef, ResultSelector, StepDefinition,
    WorkflowBuilder, WorkflowDefinition,
};
