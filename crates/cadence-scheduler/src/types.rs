//! Scheduler types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::handler::Handler;

/// Unique (per scheduler) id of a scheduled occurrence or retry.
pub type InstanceId = u64;

/// A registered job. Immutable once created; shared by all of its instances.
pub struct JobDefinition {
    key: String,
    interval: Option<Duration>,
    handler: Arc<dyn Handler>,
    max_attempts: u32,
    timeout: Duration,
}

impl JobDefinition {
    pub fn new(
        key: String,
        interval: Option<Duration>,
        handler: Arc<dyn Handler>,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            key,
            interval,
            handler,
            max_attempts,
            timeout,
        }
    }

    /// Identity used for locking and registration.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Recurrence interval; `None` for one-shot jobs.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn is_recurring(&self) -> bool {
        self.interval.is_some()
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a single instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Waiting in the queue.
    #[default]
    Pending,
    /// Dispatched to a worker.
    Running,
    /// Handler returned success.
    Succeeded,
    /// Handler failed, timed out, or panicked.
    Failed,
    /// Failed and a follow-up attempt has been queued.
    RetryScheduled,
}

impl InstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Succeeded | InstanceState::Failed)
    }
}

/// One scheduled occurrence (or retry) of a [`JobDefinition`].
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub id: InstanceId,
    pub definition: Arc<JobDefinition>,
    /// When this instance becomes eligible for dispatch.
    pub due_time: Timestamp,
    /// Scheduled time of the occurrence this instance belongs to. Retries
    /// keep their occurrence so recurrence never drifts.
    pub occurrence: Timestamp,
    /// Starts at 1, incremented per retry.
    pub attempt: u32,
    pub state: InstanceState,
    /// Extra run outside the recurrence (see
    /// [`Scheduler::trigger`](crate::Scheduler::trigger)). Never schedules a
    /// follow-up occurrence.
    pub one_off: bool,
}

impl JobInstance {
    /// First attempt of a new occurrence due at `due_time`.
    pub fn new(id: InstanceId, definition: Arc<JobDefinition>, due_time: Timestamp) -> Self {
        Self {
            id,
            definition,
            due_time,
            occurrence: due_time,
            attempt: 1,
            state: InstanceState::Pending,
            one_off: false,
        }
    }

    /// A run of `definition` that does not feed the recurrence.
    pub fn one_off(id: InstanceId, definition: Arc<JobDefinition>, due_time: Timestamp) -> Self {
        Self {
            one_off: true,
            ..Self::new(id, definition, due_time)
        }
    }

    pub fn key(&self) -> &str {
        self.definition.key()
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.state == InstanceState::Pending && self.due_time <= now
    }

    /// Whether another attempt is still allowed after this one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.definition.max_attempts()
    }

    /// Follow-up attempt for the same occurrence.
    pub fn retry(&self, id: InstanceId, due_time: Timestamp) -> Self {
        Self {
            id,
            definition: Arc::clone(&self.definition),
            due_time,
            occurrence: self.occurrence,
            attempt: self.attempt + 1,
            state: InstanceState::Pending,
            one_off: self.one_off,
        }
    }

    /// Next fixed-rate slot strictly after `now`, or `None` for one-shot jobs.
    ///
    /// Measured from `occurrence`, not from completion time. Slots that have
    /// already passed (slow handler, long retry chain) are skipped rather
    /// than fired in a burst.
    pub fn next_occurrence(&self, now: Timestamp) -> Option<Timestamp> {
        if self.one_off {
            return None;
        }
        let interval = self.definition.interval()?;
        if interval.is_zero() {
            return None;
        }

        let first = self.occurrence + interval;
        if first > now {
            return Some(first);
        }

        let behind = now.saturating_duration_since(self.occurrence).as_nanos();
        let periods = behind / interval.as_nanos() + 1;
        let next = self.occurrence.since_origin().as_nanos() + periods * interval.as_nanos();
        Some(Timestamp::from_duration(Duration::from_nanos(
            u64::try_from(next).unwrap_or(u64::MAX),
        )))
    }
}

/// A registration request. See [`Scheduler::register`](crate::Scheduler::register).
#[derive(Clone)]
pub struct JobSpec {
    pub key: String,
    pub interval: Option<Duration>,
    pub handler: Arc<dyn Handler>,
    /// Defaults to the scheduler's configured retry limit.
    pub max_attempts: Option<u32>,
    /// Defaults to the scheduler's configured timeout.
    pub timeout: Option<Duration>,
    /// First due time. Defaults to `now + interval` for recurring jobs and
    /// `now` for one-shot jobs.
    pub start_at: Option<Timestamp>,
}

impl JobSpec {
    /// A job that runs every `interval`.
    pub fn recurring(key: impl Into<String>, interval: Duration, handler: impl Handler) -> Self {
        Self {
            key: key.into(),
            interval: Some(interval),
            handler: Arc::new(handler),
            max_attempts: None,
            timeout: None,
            start_at: None,
        }
    }

    /// A job that runs once.
    pub fn once(key: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            key: key.into(),
            interval: None,
            handler: Arc::new(handler),
            max_attempts: None,
            timeout: None,
            start_at: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn start_at(mut self, at: Timestamp) -> Self {
        self.start_at = Some(at);
        self
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .field("max_attempts", &self.max_attempts)
            .field("timeout", &self.timeout)
            .field("start_at", &self.start_at)
            .finish_non_exhaustive()
    }
}
