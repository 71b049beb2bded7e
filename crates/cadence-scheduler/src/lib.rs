//! In-process recurring job scheduler.
//!
//! This crate provides a scheduler that:
//! - Runs one-shot and fixed-rate recurring jobs
//! - Never runs two instances of the same job key at once
//! - Retries failures with jittered exponential backoff
//! - Enforces a per-dispatch timeout and survives panicking handlers
//! - Reports every dispatch attempt as an [`ExecutionRecord`]
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use cadence_scheduler::{JobSpec, LogReport, Scheduler, SchedulerConfig, handler_fn};
//!
//! # async fn example() -> Result<(), cadence_scheduler::SchedulerError> {
//! let scheduler = Scheduler::new(SchedulerConfig::default(), Arc::new(LogReport))?;
//! scheduler
//!     .register(JobSpec::recurring(
//!         "health-check",
//!         Duration::from_secs(30),
//!         handler_fn(|_job| async { Ok(()) }),
//!     ))
//!     .await?;
//! scheduler.start()?;
//! // ...
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```

mod clock;
mod config;
mod error;
mod handler;
mod lock;
mod queue;
mod report;
mod retry;
mod scheduler;
mod types;

pub use clock::{Clock, ManualClock, Timestamp, TokioClock};
pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use handler::{
    ErrorKind, FnHandler, Handler, HandlerError, HandlerResult, RetryingHandler, handler_fn,
};
pub use lock::{JobKeyLock, LockEntry};
pub use queue::JobQueue;
pub use report::{
    ChannelReport, ExecutionRecord, ExecutionReport, JsonLinesReport, LogReport, MemoryReport,
    Outcome, Tee,
};
pub use retry::{JITTER_HIGH, JITTER_LOW, MIN_DELAY, RetryPolicy};
pub use scheduler::{Scheduler, SchedulerBuilder, TickSummary};
pub use types::{InstanceId, InstanceState, JobDefinition, JobInstance, JobSpec};
