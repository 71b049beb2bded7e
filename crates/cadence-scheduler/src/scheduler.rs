//! Job scheduler implementation.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, Timestamp, TokioClock};
use crate::config::{SchedulerConfig, duration_ms};
use crate::error::{Result, SchedulerError};
use crate::handler::{HandlerError, HandlerResult};
use crate::lock::JobKeyLock;
use crate::queue::JobQueue;
use crate::report::{ExecutionRecord, ExecutionReport, LogReport};
use crate::retry::RetryPolicy;
use crate::types::{InstanceId, InstanceState, JobDefinition, JobInstance, JobSpec};

/// What one pass of the dispatch loop did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Instances handed to the worker pool.
    pub dispatched: usize,
    /// Instances pushed back because their key was busy.
    pub skipped: usize,
    /// Due instances discarded because their job was unregistered.
    pub dropped: usize,
    /// Finished executions processed.
    pub completed: usize,
}

/// A finished execution travelling from a worker back to the loop.
struct Completion {
    instance: JobInstance,
    result: HandlerResult,
    duration: Duration,
}

struct Inner {
    config: SchedulerConfig,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    report: Arc<dyn ExecutionReport>,
    registry: RwLock<HashMap<String, Arc<JobDefinition>>>,
    queue: Mutex<JobQueue>,
    locks: Arc<JobKeyLock>,
    workers: Arc<Semaphore>,
    next_id: AtomicU64,
    running: AtomicUsize,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: Mutex<mpsc::UnboundedReceiver<Completion>>,
    wake: Notify,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Builder for [`Scheduler`].
#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    report: Option<Arc<dyn ExecutionReport>>,
    retry: Option<RetryPolicy>,
}

impl SchedulerBuilder {
    /// Set the scheduler configuration. Validated by [`build`](Self::build).
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom time source (defaults to [`TokioClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Where execution records go (defaults to [`LogReport`]).
    pub fn report(mut self, report: Arc<dyn ExecutionReport>) -> Self {
        self.report = Some(report);
        self
    }

    /// Override the backoff curve from the config.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Build the scheduler. Fails if the config doesn't validate.
    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            retry: self.retry.unwrap_or(self.config.retry),
            clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock::new())),
            report: self.report.unwrap_or_else(|| Arc::new(LogReport)),
            registry: RwLock::new(HashMap::new()),
            queue: Mutex::new(JobQueue::new()),
            locks: Arc::new(JobKeyLock::new()),
            workers: Arc::new(Semaphore::new(self.config.max_workers)),
            next_id: AtomicU64::new(1),
            running: AtomicUsize::new(0),
            completions_tx,
            completions_rx: Mutex::new(completions_rx),
            wake: Notify::new(),
            config: self.config,
        };

        Ok(Scheduler {
            inner: Arc::new(inner),
            lifecycle: StdMutex::new(None),
        })
    }
}

/// The job scheduler.
///
/// One dispatch loop decides what is due; handlers run on a bounded worker
/// pool. Owned by the caller: nothing starts until [`start`](Self::start)
/// (or [`run`](Self::run)) is called.
pub struct Scheduler {
    inner: Arc<Inner>,
    lifecycle: StdMutex<Option<Running>>,
}

impl Scheduler {
    /// Create a scheduler on the tokio clock.
    pub fn new(config: SchedulerConfig, report: Arc<dyn ExecutionReport>) -> Result<Self> {
        Self::builder().config(config).report(report).build()
    }

    /// Start building a scheduler with a custom clock, report or retry curve.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// The configuration this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// The time source driving dispatch and timeouts.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Register a job and queue its first instance.
    #[tracing::instrument(skip(self, spec), fields(key = %spec.key))]
    pub async fn register(&self, spec: JobSpec) -> Result<Arc<JobDefinition>> {
        if spec.key.is_empty() {
            return Err(SchedulerError::invalid("job key must not be empty"));
        }
        if spec.interval.is_some_and(|interval| interval.is_zero()) {
            return Err(SchedulerError::invalid("interval must be > 0"));
        }
        let max_attempts = spec
            .max_attempts
            .unwrap_or(self.inner.config.retry.max_attempts);
        if max_attempts == 0 {
            return Err(SchedulerError::invalid("max_attempts must be >= 1"));
        }
        let timeout = spec.timeout.unwrap_or(self.inner.config.default_timeout);
        if timeout.is_zero() {
            return Err(SchedulerError::invalid("timeout must be > 0"));
        }

        let mut registry = self.inner.registry.write().await;
        if registry.contains_key(&spec.key) {
            return Err(SchedulerError::JobExists(spec.key));
        }

        let definition = Arc::new(JobDefinition::new(
            spec.key.clone(),
            spec.interval,
            spec.handler,
            max_attempts,
            timeout,
        ));

        let now = self.inner.clock.now();
        let due = spec
            .start_at
            .unwrap_or_else(|| now + spec.interval.unwrap_or(Duration::ZERO));
        let instance = JobInstance::new(self.inner.next_id(), Arc::clone(&definition), due);

        registry.insert(spec.key, Arc::clone(&definition));
        self.inner.queue.lock().await.insert(instance);
        drop(registry);

        info!(
            interval_ms = definition.interval().map(duration_ms::millis),
            max_attempts,
            due = %due,
            "registered job"
        );
        self.inner.wake.notify_one();
        Ok(definition)
    }

    /// Remove a job. Returns `false` if it wasn't registered.
    ///
    /// Queued instances are discarded. Executions already running finish
    /// normally but nothing is rescheduled for them.
    #[tracing::instrument(skip(self))]
    pub async fn unregister(&self, key: &str) -> bool {
        let Some(definition) = self.inner.registry.write().await.remove(key) else {
            debug!("unregister of unknown job ignored");
            return false;
        };

        let purged = self
            .inner
            .queue
            .lock()
            .await
            .retain(|instance| !Arc::ptr_eq(&instance.definition, &definition));

        info!(purged, "unregistered job");
        true
    }

    /// Queue an extra immediate run of a registered job.
    ///
    /// The run does not shift the job's recurrence. It competes for the key's
    /// lock like any other instance.
    #[tracing::instrument(skip(self))]
    pub async fn trigger(&self, key: &str) -> Result<InstanceId> {
        let definition = self
            .inner
            .registry
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(key.to_string()))?;

        let id = self.inner.next_id();
        let now = self.inner.clock.now();
        self.inner
            .queue
            .lock()
            .await
            .insert(JobInstance::one_off(id, definition, now));

        debug!(instance_id = id, "triggered job");
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// List all registered jobs.
    pub async fn definitions(&self) -> Vec<Arc<JobDefinition>> {
        let mut definitions: Vec<_> = self.inner.registry.read().await.values().cloned().collect();
        definitions.sort_by(|a, b| a.key().cmp(b.key()));
        definitions
    }

    /// Get a job by key.
    pub async fn definition(&self, key: &str) -> Option<Arc<JobDefinition>> {
        self.inner.registry.read().await.get(key).cloned()
    }

    /// Check whether a job is registered under `key`.
    pub async fn is_registered(&self, key: &str) -> bool {
        self.inner.registry.read().await.contains_key(key)
    }

    /// Number of queued instances.
    pub async fn pending_len(&self) -> usize {
        self.inner.queue.lock().await.len()
    }

    /// Due time of the earliest queued instance.
    pub async fn next_due(&self) -> Option<Timestamp> {
        self.inner.queue.lock().await.next_due()
    }

    /// Executions dispatched whose completion hasn't been processed yet.
    pub fn running_len(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether an instance of `key` currently holds its lock.
    pub fn is_running(&self, key: &str) -> bool {
        self.inner.locks.is_locked(key)
    }

    /// Nudge the loop to re-check the queue.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    /// Run one dispatch cycle: process finished executions, then dispatch
    /// everything due.
    ///
    /// [`run`](Self::run) calls this in a loop; tests call it directly to
    /// step through time.
    pub async fn tick(&self) -> Result<TickSummary> {
        self.inner.tick().await
    }

    /// Wait for the next execution to finish and process it.
    pub async fn complete_next(&self) -> Result<()> {
        let completion = self.inner.completions_rx.lock().await.recv().await;
        match completion {
            Some(completion) => self.inner.complete(completion).await,
            None => Err(SchedulerError::Internal(
                "completion channel closed".to_string(),
            )),
        }
    }

    /// Run the scheduler loop until `shutdown_rx` flips to `true`.
    ///
    /// Only returns an error when an internal invariant breaks.
    pub async fn run(&self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        Arc::clone(&self.inner).run(shutdown_rx).await
    }

    /// Spawn the loop onto the current tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if lifecycle.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            if let Err(e) = inner.run(shutdown_rx).await {
                error!(error = %e, "scheduler loop halted");
            }
        });

        *lifecycle = Some(Running {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the loop started by [`start`](Self::start) and wait for it.
    ///
    /// Handlers already running are left to finish on their own.
    pub async fn stop(&self) {
        let running = self
            .lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(Running {
            shutdown_tx,
            handle,
        }) = running
        else {
            return;
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!(error = %e, "scheduler task failed");
        }
    }

    /// Whether the loop from [`start`](Self::start) is active.
    pub fn is_started(&self) -> bool {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

/// Why the loop woke up.
enum Wakeup {
    Shutdown,
    Completed(Option<Completion>),
    Nudged,
    Timer,
}

impl Inner {
    fn next_id(&self) -> InstanceId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Still registered under the same definition (a re-registered key
    /// doesn't resurrect the old job's instances).
    async fn is_current(&self, definition: &Arc<JobDefinition>) -> bool {
        self.registry
            .read()
            .await
            .get(definition.key())
            .is_some_and(|current| Arc::ptr_eq(current, definition))
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!("scheduler starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.tick().await?;

            let now = self.clock.now();
            let idle = now + self.config.idle_poll;
            let deadline = self
                .queue
                .lock()
                .await
                .next_due()
                .map_or(idle, |next| next.min(idle));

            let wakeup = {
                let mut completions = self.completions_rx.lock().await;
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            Wakeup::Shutdown
                        } else {
                            Wakeup::Nudged
                        }
                    }
                    completion = completions.recv() => Wakeup::Completed(completion),
                    _ = self.wake.notified() => Wakeup::Nudged,
                    _ = self.clock.sleep_until(deadline) => Wakeup::Timer,
                }
            };

            match wakeup {
                Wakeup::Shutdown => {
                    info!("scheduler received shutdown signal");
                    break;
                }
                Wakeup::Completed(Some(completion)) => self.complete(completion).await?,
                Wakeup::Completed(None) => {
                    return Err(SchedulerError::Internal(
                        "completion channel closed".to_string(),
                    ));
                }
                Wakeup::Nudged | Wakeup::Timer => {}
            }
        }

        info!(running = self.running.load(Ordering::SeqCst), "scheduler shut down gracefully");
        Ok(())
    }

    async fn tick(self: &Arc<Self>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        // The run loop holds the receiver while it waits; it handles
        // completions itself in that case.
        loop {
            let completion = match self.completions_rx.try_lock() {
                Ok(mut rx) => rx.try_recv().ok(),
                Err(_) => None,
            };
            let Some(completion) = completion else {
                break;
            };
            self.complete(completion).await?;
            summary.completed += 1;
        }

        let now = self.clock.now();
        let due = self.queue.lock().await.peek_due(now);

        for mut instance in due {
            if instance.attempt == 0 || instance.attempt > instance.definition.max_attempts() {
                let msg = format!(
                    "instance {} of {} at attempt {} (max {})",
                    instance.id,
                    instance.key(),
                    instance.attempt,
                    instance.definition.max_attempts()
                );
                error!(%msg, "attempt count out of range");
                debug_assert!(false, "{msg}");
                return Err(SchedulerError::Internal(msg));
            }

            if !self.is_current(&instance.definition).await {
                debug!(key = %instance.key(), instance_id = instance.id, "dropping instance of unregistered job");
                summary.dropped += 1;
                continue;
            }

            if !self.locks.try_acquire(instance.key(), instance.id, now) {
                debug!(
                    key = %instance.key(),
                    instance_id = instance.id,
                    attempt = instance.attempt,
                    "key busy, skipping"
                );
                self.report.record(ExecutionRecord::skipped(&instance));
                instance.due_time = now + self.config.skip_retry_interval;
                self.queue.lock().await.insert(instance);
                summary.skipped += 1;
                continue;
            }

            instance.state = InstanceState::Running;
            self.dispatch(instance);
            summary.dispatched += 1;
        }

        Ok(summary)
    }

    /// Hand a locked instance to the worker pool.
    fn dispatch(self: &Arc<Self>, instance: JobInstance) {
        debug!(
            key = %instance.key(),
            instance_id = instance.id,
            attempt = instance.attempt,
            "dispatching job"
        );
        self.running.fetch_add(1, Ordering::SeqCst);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // The semaphore is never closed.
            let permit = Arc::clone(&inner.workers).acquire_owned().await.ok();
            let started = inner.clock.now();
            let result = inner.execute(&instance, permit).await;
            let duration = inner.clock.now().saturating_duration_since(started);

            let completion = Completion {
                instance,
                result,
                duration,
            };
            if inner.completions_tx.send(completion).is_err() {
                warn!("scheduler gone, dropping completion");
            }
        });
    }

    /// Run the handler under its timeout, turning panics and timeouts into
    /// classified errors.
    ///
    /// The worker permit travels with the handler task, so a handler
    /// abandoned after a timeout still occupies its slot until it returns.
    async fn execute(
        &self,
        instance: &JobInstance,
        permit: Option<OwnedSemaphorePermit>,
    ) -> HandlerResult {
        let handler = Arc::clone(instance.definition.handler());
        let snapshot = instance.clone();
        let locks = Arc::clone(&self.locks);
        let key = instance.key().to_string();
        let holder = instance.id;

        let mut task = tokio::spawn(async move {
            let _permit = permit;
            let result = handler.execute(snapshot).await;
            // No-op if the scheduler already force-released after a timeout
            locks.release_held(&key, holder);
            result
        });

        let timeout = instance.definition.timeout();
        let deadline = self.clock.now() + timeout;

        tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(HandlerError::permanent(format!(
                    "handler panicked: {}",
                    panic_message(e.into_panic())
                ))),
                Err(e) => Err(HandlerError::permanent(format!("handler task failed: {e}"))),
            },
            _ = self.clock.sleep_until(deadline) => {
                self.locks.release_held(instance.key(), instance.id);
                warn!(
                    key = %instance.key(),
                    instance_id = instance.id,
                    timeout_ms = duration_ms::millis(timeout),
                    "handler timed out, lock released"
                );
                Err(HandlerError::timeout(format!(
                    "no result after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Record the outcome and decide what, if anything, runs next.
    async fn complete(&self, completion: Completion) -> Result<()> {
        let Completion {
            mut instance,
            result,
            duration,
        } = completion;

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.locks.release_held(instance.key(), instance.id);

        let now = self.clock.now();
        let registered = self.is_current(&instance.definition).await;

        let next = match result {
            Ok(()) => {
                instance.state = InstanceState::Succeeded;
                self.report.record(ExecutionRecord::ok(&instance, duration));
                debug!(key = %instance.key(), attempt = instance.attempt, "job succeeded");

                instance
                    .next_occurrence(now)
                    .map(|due| JobInstance::new(self.next_id(), Arc::clone(&instance.definition), due))
            }
            Err(err) => {
                instance.state = InstanceState::Failed;
                self.report
                    .record(ExecutionRecord::error(&instance, duration, &err));

                let policy = self
                    .retry
                    .with_max_attempts(instance.definition.max_attempts());
                match policy.next_delay(instance.attempt, err.kind)? {
                    Some(delay) => {
                        instance.state = InstanceState::RetryScheduled;
                        warn!(
                            key = %instance.key(),
                            attempt = instance.attempt,
                            retry_in_ms = duration_ms::millis(delay),
                            error = %err,
                            "job failed, scheduled retry"
                        );
                        Some(instance.retry(self.next_id(), now + delay))
                    }
                    None => {
                        error!(
                            key = %instance.key(),
                            attempt = instance.attempt,
                            error = %err,
                            "job failed, giving up on this occurrence"
                        );
                        instance
                            .next_occurrence(now)
                            .map(|due| JobInstance::new(self.next_id(), Arc::clone(&instance.definition), due))
                    }
                }
            }
        };

        match next {
            Some(next) if registered => {
                debug!(key = %next.key(), due = %next.due_time, attempt = next.attempt, "rescheduled job");
                self.queue.lock().await.insert(next);
            }
            Some(_) => debug!(key = %instance.key(), "job unregistered, not rescheduling"),
            None => {}
        }
        Ok(())
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
