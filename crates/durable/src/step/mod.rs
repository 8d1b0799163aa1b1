//! Steps: the unit of work in a saga
//!
//! A step has an invoke handler and an optional compensate handler. Both
//! receive a [`StepContext`] and return a JSON value or a [`StepError`].

mod context;
mod error;
mod handler;
mod services;

pub use context::StepContext;
pub use error::{StepError, StepErrorKind};
pub use handler::{handler_fn, Handler, StepHandler, StepResult};
pub use services::Services;
