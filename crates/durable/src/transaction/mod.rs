//! Transaction runtime model
//!
//! This module provides:
//! - [`TransactionCheckpoint`] - The persisted snapshot of one transaction
//! - [`TransactionState`], [`StepState`], [`StepStatus`] - State machines
//! - [`IdempotencyKey`] - Identifier of one handler invocation

mod checkpoint;
mod idempotency;
mod state;

pub use checkpoint::{
    checkpoint_key, StepRecord, TransactionCheckpoint, TransactionContext, TransactionFlow,
    TransactionOptions, TransactionStepError,
};
pub use idempotency::{HandlerType, IdempotencyKey, IdempotencyKeyError, KEY_SEPARATOR};
pub use state::{StepState, StepStatus, TransactionState};
