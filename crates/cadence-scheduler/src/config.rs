//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::retry::RetryPolicy;

const DEFAULT_MAX_WORKERS: usize = 8;
const DEFAULT_SKIP_RETRY_MS: u64 = 1_000;
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_IDLE_POLL_MS: u64 = 60_000;

/// Tunables for a [`Scheduler`](crate::Scheduler).
///
/// Deserializes from JSON with durations given in milliseconds; any field
/// left out takes its default.
///
/// ```rust
/// use cadence_scheduler::SchedulerConfig;
///
/// let config: SchedulerConfig =
///     serde_json::from_str(r#"{ "max_workers": 2, "skip_retry_interval_ms": 250 }"#).unwrap();
/// assert_eq!(config.max_workers, 2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Size of the handler worker pool.
    pub max_workers: usize,

    /// How soon a job skipped for lock contention is retried.
    #[serde(rename = "skip_retry_interval_ms", with = "duration_ms")]
    pub skip_retry_interval: Duration,

    /// Per-dispatch timeout for jobs registered without their own.
    #[serde(rename = "default_timeout_ms", with = "duration_ms")]
    pub default_timeout: Duration,

    /// Longest the loop sleeps when nothing is queued.
    #[serde(rename = "idle_poll_ms", with = "duration_ms")]
    pub idle_poll: Duration,

    /// Backoff curve. `max_attempts` here is the default for new jobs.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            skip_retry_interval: Duration::from_millis(DEFAULT_SKIP_RETRY_MS),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
            retry: RetryPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(SchedulerError::invalid("max_workers must be > 0"));
        }
        if self.skip_retry_interval.is_zero() {
            return Err(SchedulerError::invalid("skip_retry_interval must be > 0"));
        }
        if self.default_timeout.is_zero() {
            return Err(SchedulerError::invalid("default_timeout must be > 0"));
        }
        if self.idle_poll.is_zero() {
            return Err(SchedulerError::invalid("idle_poll must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::invalid("retry.max_attempts must be >= 1"));
        }
        if self.retry.max_delay < self.retry.base {
            return Err(SchedulerError::invalid("retry.max_delay must be >= retry.base"));
        }
        Ok(())
    }
}

/// Serde adapter: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Whole milliseconds, saturating at `u64::MAX`.
    pub fn millis(value: Duration) -> u64 {
        u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
