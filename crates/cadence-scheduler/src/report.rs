//! Execution outcomes and the sinks that receive them.
//!
//! Every dispatch attempt produces exactly one [`ExecutionRecord`]. This is
//! the only channel through which job failures become visible; the
//! scheduler never surfaces them any other way.

use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::clock::Timestamp;
use crate::config::duration_ms;
use crate::handler::{ErrorKind, HandlerError};
use crate::types::{InstanceId, JobInstance};

/// What happened to a dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Error,
    /// Another instance of the same key was running.
    SkippedLocked,
}

/// Immutable snapshot of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub key: String,
    pub instance_id: InstanceId,
    pub attempt: u32,
    pub outcome: Outcome,
    #[serde(rename = "duration_ms", with = "duration_ms")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Due time of the dispatched instance, in scheduler clock time.
    #[serde(rename = "scheduled_for_ms")]
    pub scheduled_for: Timestamp,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    fn base(instance: &JobInstance, outcome: Outcome, duration: Duration) -> Self {
        Self {
            key: instance.key().to_string(),
            instance_id: instance.id,
            attempt: instance.attempt,
            outcome,
            duration,
            error_kind: None,
            error_detail: None,
            scheduled_for: instance.due_time,
            recorded_at: Utc::now(),
        }
    }

    pub fn ok(instance: &JobInstance, duration: Duration) -> Self {
        Self::base(instance, Outcome::Ok, duration)
    }

    pub fn error(instance: &JobInstance, duration: Duration, error: &HandlerError) -> Self {
        Self {
            error_kind: Some(error.kind),
            error_detail: Some(error.message.clone()),
            ..Self::base(instance, Outcome::Error, duration)
        }
    }

    pub fn skipped(instance: &JobInstance) -> Self {
        Self::base(instance, Outcome::SkippedLocked, Duration::ZERO)
    }
}

/// Receives execution records. Must not block for long: it is called from
/// the dispatch loop.
pub trait ExecutionReport: Send + Sync + 'static {
    fn record(&self, record: ExecutionRecord);
}

impl<R: ExecutionReport + ?Sized> ExecutionReport for Arc<R> {
    fn record(&self, record: ExecutionRecord) {
        (**self).record(record);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the guard can't leave a Vec or writer in a state
    // worse than "partially written", so keep going.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keeps every record in memory. Useful for tests and for callers that poll.
#[derive(Debug, Default)]
pub struct MemoryReport {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl MemoryReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        lock(&self.records).clone()
    }

    pub fn for_key(&self, key: &str) -> Vec<ExecutionRecord> {
        lock(&self.records)
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect()
    }

    pub fn count(&self, key: &str, outcome: Outcome) -> usize {
        lock(&self.records)
            .iter()
            .filter(|r| r.key == key && r.outcome == outcome)
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    pub fn clear(&self) {
        lock(&self.records).clear();
    }
}

impl ExecutionReport for MemoryReport {
    fn record(&self, record: ExecutionRecord) {
        lock(&self.records).push(record);
    }
}

/// Forwards records over a channel to an async consumer.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    tx: mpsc::UnboundedSender<ExecutionRecord>,
}

impl ChannelReport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ExecutionReport for ChannelReport {
    fn record(&self, record: ExecutionRecord) {
        if self.tx.send(record).is_err() {
            debug!("execution report receiver dropped");
        }
    }
}

/// Emits records as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReport;

impl ExecutionReport for LogReport {
    fn record(&self, record: ExecutionRecord) {
        let duration_ms = duration_ms::millis(record.duration);
        match record.outcome {
            Outcome::Ok => debug!(
                key = %record.key,
                attempt = record.attempt,
                duration_ms,
                "job succeeded"
            ),
            Outcome::Error => warn!(
                key = %record.key,
                attempt = record.attempt,
                duration_ms,
                kind = ?record.error_kind,
                error = record.error_detail.as_deref().unwrap_or(""),
                "job failed"
            ),
            Outcome::SkippedLocked => debug!(
                key = %record.key,
                attempt = record.attempt,
                "job skipped, key busy"
            ),
        }
    }
}

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesReport<W> {
    out: Mutex<W>,
}

impl<W: Write + Send + 'static> JsonLinesReport<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<W: Write + Send + 'static> ExecutionReport for JsonLinesReport<W> {
    fn record(&self, record: ExecutionRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(key = %record.key, error = %e, "failed to encode execution record");
                return;
            }
        };

        let mut out = lock(&self.out);
        if let Err(e) = writeln!(out, "{line}").and_then(|()| out.flush()) {
            warn!(key = %record.key, error = %e, "failed to write execution record");
        }
    }
}

/// Fans records out to several sinks.
#[derive(Default)]
pub struct Tee {
    sinks: Vec<Arc<dyn ExecutionReport>>,
}

impl Tee {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn ExecutionReport>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl ExecutionReport for Tee {
    fn record(&self, record: ExecutionRecord) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(record.clone());
            }
            last.record(record);
        }
    }
}
