//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
///
/// These surface synchronously to callers of the registration and retry
/// APIs. Handler failures never show up here; they are recorded in the
/// execution report instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller misuse (zero attempt count, empty key, zero interval, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Job already registered under this key.
    #[error("job already exists: {0}")]
    JobExists(String),

    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The scheduler loop has already been started.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// Internal invariant violated. Indicates a bug, not a runtime condition.
    #[error("scheduler invariant violated: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;
