//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`Deadline`] - Wall-clock deadlines for step and transaction timeouts

mod retry;
mod timeout;

pub use retry::RetryPolicy;
pub use timeout::Deadline;

pub(crate) use timeout::sleep_until;
