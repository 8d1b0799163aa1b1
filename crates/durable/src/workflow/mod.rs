//! Workflow definitions
//!
//! This module contains the workflow graph primitives:
//! - [`StepDefinition`] for a single step and its policies
//! - [`WorkflowBuilder`] for composing and validating a graph
//! - [`WorkflowDefinition`] for the validated, topologically ordered graph
//! - [`ResultSelector`] for deriving a transaction result from step outputs

mod builder;
mod definition;
mod selector;

pub use builder::{DefinitionError, WorkflowBuilder, SUB_FLOW_SEPARATOR};
pub use definition::{
    Condition, ContinueOnFailurePolicy, StepDefinition, WorkflowDefinition, WorkflowOptions,
};
pub use selector::{OutputRef, ResultSelector};
