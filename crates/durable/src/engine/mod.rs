//! Saga execution engine
//!
//! The engine module provides the `WorkflowOrchestrator` which drives
//! transactions forward through their step graph and backward through
//! compensation, persisting a checkpoint after every transition.

mod config;
mod events;
mod executor;
mod locks;
mod planner;
mod registry;

pub use config::OrchestratorConfig;
pub use events::TransactionObserver;
pub use executor::{
    CallbackOptions, ExecutorError, RunOptions, WorkflowOrchestrator, WorkflowResult,
};
pub use registry::{RegistryError, WorkflowRegistry};
