//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`CheckpointStorage`] trait for checkpoint and timer persistence
//! - [`ExecutionLog`] trait for the queryable execution history
//! - [`InMemoryCheckpointStorage`] for single-node use and tests
//! - [`PostgresCheckpointStorage`] for production

use std::time::Duration;

mod execution_log;
mod memory;
mod postgres;
mod store;

pub use execution_log::{ExecutionContext, ExecutionLog, ExecutionRecord, InMemoryExecutionLog};
pub use memory::InMemoryCheckpointStorage;
pub use postgres::{PostgresCheckpointStorage, PostgresExecutionLog, PostgresStorageConfig};
pub use store::{CheckpointStorage, StoreError};

/// How long a finished transaction's snapshot stays readable by default
pub const DEFAULT_COMPLETED_TTL: Duration = Duration::from_secs(15 * 60);
