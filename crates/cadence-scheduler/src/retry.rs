//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;
use crate::error::{Result, SchedulerError};
use crate::handler::ErrorKind;

/// Smallest delay ever returned.
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Jitter bounds, applied multiplicatively.
pub const JITTER_LOW: f64 = 0.5;
pub const JITTER_HIGH: f64 = 1.5;

/// Computes how long to wait before the next attempt of a failed job.
///
/// Delay for attempt `n` (the attempt that just failed) is
/// `min(base * 2^(n-1), max_delay)`, scaled by a uniform factor in
/// `[0.5, 1.5]` so identically configured jobs don't retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(rename = "base_ms", with = "duration_ms")]
    pub base: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay,
            max_attempts,
        }
    }

    /// Same curve, bounded by a job's own attempt limit.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Jitter-free delay for `attempt`, capped at `max_delay`.
    pub fn expected_delay(&self, attempt: u32) -> Result<Duration> {
        if attempt == 0 {
            return Err(SchedulerError::invalid("attempt must be >= 1"));
        }
        let doubled = 1u32
            .checked_shl(attempt - 1)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max_delay);
        Ok(doubled.min(self.max_delay).max(MIN_DELAY))
    }

    /// Delay before the attempt after `attempt`, or `None` to stop retrying.
    pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> Result<Option<Duration>> {
        self.next_delay_with(attempt, kind, &mut rand::rng())
    }

    /// [`next_delay`](Self::next_delay) with an explicit random source.
    pub fn next_delay_with<R: Rng>(
        &self,
        attempt: u32,
        kind: ErrorKind,
        rng: &mut R,
    ) -> Result<Option<Duration>> {
        let expected = self.expected_delay(attempt)?;

        if !kind.is_retryable() || attempt >= self.max_attempts {
            return Ok(None);
        }

        let factor = rng.random_range(JITTER_LOW..=JITTER_HIGH);
        Ok(Some(expected.mul_f64(factor).max(MIN_DELAY)))
    }
}
