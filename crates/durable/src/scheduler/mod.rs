//! Timers that re-enter transactions
//!
//! Retries with a positive interval, step deadlines and transaction deadlines
//! are persisted as [`ScheduledJob`]s by the storage backend. When one fires
//! it reaches the [`JobDispatcher`], which resumes the transaction through the
//! orchestrator.
//!
//! ```text
//! ┌──────────────────────┐  fired job   ┌───────────────┐  run()  ┌──────────────┐
//! │ in-memory timers     │─────────────▶│ JobDispatcher │────────▶│ Orchestrator │
//! │ or JobPoller (SQL)   │   (mpsc)     └───────┬───────┘         └──────────────┘
//! └──────────────────────┘                      │ ack
//!                                               ▼
//!                                         storage backend
//! ```

mod dispatcher;
mod job;
mod poller;

pub use dispatcher::{DispatchError, JobDispatcher, JobTarget};
pub use job::{job_id, JobKind, JobReceiver, JobSender, ScheduledJob};
pub use poller::{spawn_poll_loop, JobPoller, JobSource, PollerConfig};
