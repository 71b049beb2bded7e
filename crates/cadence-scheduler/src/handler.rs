//! The handler contract: what a scheduled job actually runs.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::{Clock, TokioClock};
use crate::config::duration_ms;
use crate::retry::RetryPolicy;
use crate::types::JobInstance;

/// Classification of a handler failure. Drives retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Worth retrying (network blip, busy upstream, ...).
    Transient,
    /// Retrying won't help. Also used for handler panics.
    Permanent,
    /// The dispatch exceeded its timeout.
    Timeout,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Permanent)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
        })
    }
}

/// A classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }
}

/// What a handler returns.
pub type HandlerResult = Result<(), HandlerError>;

/// Something the scheduler can run.
///
/// Each call receives its own snapshot of the [`JobInstance`] being
/// executed. Returning `Err` (or panicking) sends the job down the failure
/// path; it never takes the scheduler loop down.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn execute(&self, job: JobInstance) -> HandlerResult;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn execute(&self, job: JobInstance) -> HandlerResult {
        (**self).execute(job).await
    }
}

/// Adapts an async closure into a [`Handler`]. See [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

/// Build a [`Handler`] from an async closure.
///
/// ```rust
/// use cadence_scheduler::{handler_fn, HandlerError};
///
/// let handler = handler_fn(|job| async move {
///     if job.attempt < 2 {
///         Err(HandlerError::transient("warming up"))
///     } else {
///         Ok(())
///     }
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobInstance) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(JobInstance) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn execute(&self, job: JobInstance) -> HandlerResult {
        (self.f)(job).await
    }
}

/// Retries an inner handler in place, sleeping between attempts.
///
/// This is the composition counterpart of a retry decorator: the whole
/// retry sequence happens inside one dispatch, so the scheduler sees a single
/// outcome. Use it for handlers whose retries must not yield the job's lock.
pub struct RetryingHandler<H> {
    inner: H,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl<H: Handler> RetryingHandler<H> {
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            clock: Arc::new(TokioClock::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl<H: Handler> Handler for RetryingHandler<H> {
    async fn execute(&self, job: JobInstance) -> HandlerResult {
        let mut attempt = 1u32;
        loop {
            let err = match self.inner.execute(job.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            let delay = match self.policy.next_delay(attempt, err.kind) {
                Ok(Some(delay)) => delay,
                _ => {
                    warn!(key = %job.key(), attempt, error = %err, "giving up after in-place retries");
                    return Err(err);
                }
            };

            debug!(key = %job.key(), attempt, delay_ms = duration_ms::millis(delay), "retrying in place");
            let deadline = self.clock.now() + delay;
            self.clock.sleep_until(deadline).await;
            attempt += 1;
        }
    }
}
