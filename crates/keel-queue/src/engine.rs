//! Queue engine: polling loop, admission control, and outcome handling.

use crate::config::QueueConfig;
use crate::events::{FailureReason, QueueEvent};
use crate::handler::{Completion, JobHandler};
use crate::metrics::QueueMetrics;
use chrono::Utc;
use keel_core::{Job, JobId, JobOutcome, JobRecord, KeelError, KeelResult, RetryPolicy};
use keel_store::{JobStore, RescheduleOutcome, SqliteJobStore};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a dispatch ended, as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Reported(JobOutcome),
    /// Completion dropped without a report.
    Abandoned,
    TimedOut,
}

/// Queue engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Engine id.
    pub queue_id: String,

    /// Is running.
    pub running: bool,

    /// Jobs currently dispatched.
    pub active: usize,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Jobs dispatched since creation.
    pub dispatched: u64,

    /// Jobs succeeded since creation.
    pub succeeded: u64,

    /// Failed dispatches since creation, retried or not.
    pub failed: u64,
}

/// Persistent at-least-once job queue.
///
/// The engine owns a store, exactly one handler, and the in-memory set of
/// dispatched job ids. Cloning is cheap; clones share the same engine.
///
/// While running, a background task ticks every `poll_interval` (and
/// whenever a job is enqueued or resolved). Each tick admits eligible jobs
/// until `concurrency` jobs are in flight. Ticks never overlap and never
/// wait for handlers.
#[derive(Clone)]
pub struct QueueEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    id: String,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    config: QueueConfig,
    defaults: RetryPolicy,

    /// Dispatched ids and their tags. Only the admission pass inserts.
    active: Mutex<HashMap<JobId, String>>,

    running: AtomicBool,
    /// Set when a tick finds work; cleared when `Drained` is emitted.
    /// `Drained` also requires an empty store.
    backlog_seen: AtomicBool,
    tick_gate: AsyncMutex<()>,
    wake: Arc<Notify>,
    idle: Notify,

    events: broadcast::Sender<QueueEvent>,
    shutdown_tx: broadcast::Sender<()>,
    poller: Mutex<Option<JoinHandle<()>>>,

    dispatched: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl QueueEngine {
    /// Creates a stopped engine over `store`.
    pub fn new(
        store: Arc<dyn JobStore>,
        handler: Arc<dyn JobHandler>,
        config: QueueConfig,
    ) -> KeelResult<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let (shutdown_tx, _) = broadcast::channel(1);
        let id = format!("queue-{}", Uuid::new_v4());

        info!(
            queue_id = %id,
            name = %config.name,
            concurrency = config.concurrency,
            poll_interval_ms = config.poll_interval_ms,
            "Created queue engine"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                id,
                store,
                handler,
                defaults: config.retry_policy(),
                config,
                active: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                backlog_seen: AtomicBool::new(false),
                tick_gate: AsyncMutex::new(()),
                wake: Arc::new(Notify::new()),
                idle: Notify::new(),
                events,
                shutdown_tx,
                poller: Mutex::new(None),
                dispatched: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        })
    }

    /// Opens the SQLite store named by `config.store` and creates a stopped
    /// engine over it.
    pub async fn open(config: QueueConfig, handler: Arc<dyn JobHandler>) -> KeelResult<Self> {
        config.validate()?;
        let store = SqliteJobStore::open(&config.store).await?;
        store.health_check().await?;
        Self::new(Arc::new(store), handler, config)
    }

    /// Starts the polling loop. Does nothing if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> KeelResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| KeelError::Internal(format!("No Tokio runtime to start on: {}", e)))?;

        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!(queue_id = %self.inner.id, "Queue already running");
            return Ok(());
        }

        info!(
            queue_id = %self.inner.id,
            concurrency = self.inner.config.concurrency,
            "Starting queue"
        );
        self.inner.emit(QueueEvent::Started);

        let poller = runtime.spawn(
            poll_loop(
                Arc::downgrade(&self.inner),
                Arc::clone(&self.inner.wake),
                self.inner.shutdown_tx.subscribe(),
                self.inner.config.poll_interval(),
            )
            .instrument(info_span!("queue", queue_id = %self.inner.id)),
        );
        *self.inner.poller.lock() = Some(poller);

        Ok(())
    }

    /// Stops admitting jobs. In-flight handlers keep running and are
    /// resolved normally. Does nothing if already stopped.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(
            queue_id = %self.inner.id,
            active = self.active_count(),
            "Stopping queue"
        );
        let _ = self.inner.shutdown_tx.send(());
        self.inner.emit(QueueEvent::Stopped);
    }

    /// Stops the queue and waits up to `shutdown_timeout` for in-flight
    /// jobs to resolve.
    pub async fn shutdown(&self) {
        self.stop();

        let poller = self.inner.poller.lock().take();
        let finished = timeout(self.inner.config.shutdown_timeout(), async {
            if let Some(poller) = poller {
                let _ = poller.await;
            }
            self.inner.wait_idle().await;
        })
        .await;

        match finished {
            Ok(()) => info!(
                queue_id = %self.inner.id,
                succeeded = self.inner.succeeded.load(Ordering::Relaxed),
                failed = self.inner.failed.load(Ordering::Relaxed),
                "Queue shut down"
            ),
            Err(_) => warn!(
                queue_id = %self.inner.id,
                active = self.active_count(),
                "Shutdown timed out with jobs still in flight"
            ),
        }
    }

    /// Validates and persists `job`, returning its id.
    ///
    /// Works whether or not the queue is running.
    pub async fn enqueue(&self, job: Job) -> KeelResult<JobId> {
        job.validate()?;

        let policy = RetryPolicy::resolve(&job, &self.inner.defaults);
        let id = self.inner.store.create(&job, &policy).await?;

        QueueMetrics::job_enqueued(&self.inner.config.name, job.tag());
        debug!(
            queue_id = %self.inner.id,
            job_id = %id,
            tag = %job.tag(),
            max_attempts = policy.max_attempts,
            "Enqueued job"
        );

        self.trigger();
        Ok(id)
    }

    /// Deletes every stored job. Jobs already dispatched keep running.
    pub async fn empty(&self) -> KeelResult<u64> {
        let removed = self.inner.store.remove_all().await?;
        info!(queue_id = %self.inner.id, removed, "Emptied queue");
        Ok(removed)
    }

    /// Number of stored jobs, including dispatched ones.
    pub async fn count(&self) -> KeelResult<u64> {
        self.inner.store.count().await
    }

    /// Checks whether any stored job carries `tag`.
    pub async fn job_exists(&self, tag: &str) -> KeelResult<bool> {
        self.inner.store.exists(tag).await
    }

    /// Checks whether a job with `tag` is currently dispatched.
    pub fn job_is_active(&self, tag: &str) -> bool {
        self.inner.active.lock().values().any(|active| active == tag)
    }

    /// Oldest eligible job with `tag`.
    ///
    /// A pure peek: nothing is reserved, and the result may be a job that
    /// is already dispatched.
    pub async fn next_job(&self, tag: &str) -> KeelResult<Option<JobRecord>> {
        self.inner.store.fetch_next_for_tag(tag, &HashSet::new()).await
    }

    /// Requests a tick now instead of at the next interval.
    pub fn trigger(&self) {
        self.inner.wake.notify_one();
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Check if the polling loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Check if at least one job is dispatched.
    pub fn is_active(&self) -> bool {
        self.active_count() > 0
    }

    /// Number of dispatched jobs.
    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Get the engine id.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Engine configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Get engine statistics.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_id: self.inner.id.clone(),
            running: self.is_running(),
            active: self.active_count(),
            concurrency: self.inner.config.concurrency,
            dispatched: self.inner.dispatched.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("id", &self.inner.id)
            .field("running", &self.is_running())
            .field("active", &self.active_count())
            .finish()
    }
}

/// Ticks until shutdown is signalled or the engine is dropped.
async fn poll_loop(
    inner: Weak<EngineInner>,
    wake: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
    poll_interval: Duration,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {}
            () = wake.notified() => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        inner.tick().await;
    }

    debug!("Polling loop exited");
}

impl EngineInner {
    /// One admission pass.
    async fn tick(self: &Arc<Self>) {
        let _gate = self.tick_gate.lock().await;

        while self.running.load(Ordering::SeqCst) {
            let exclude: HashSet<JobId> = {
                let active = self.active.lock();
                if active.len() >= self.config.concurrency {
                    return;
                }
                active.keys().copied().collect()
            };

            let record = match self.store.fetch_next(&exclude).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.check_drained().await;
                    return;
                }
                Err(e) => {
                    self.storage_fault("fetch_next", &e);
                    return;
                }
            };

            self.backlog_seen.store(true, Ordering::SeqCst);

            if record.is_expired_at(Utc::now()) {
                if !self.discard_expired(&record).await {
                    self.store.release(record.id).await;
                    return;
                }
                continue;
            }

            self.admit(record);
        }
    }

    fn admit(self: &Arc<Self>, record: JobRecord) {
        let active = {
            let mut active = self.active.lock();
            active.insert(record.id, record.tag.clone());
            active.len()
        };

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::job_dispatched(&self.config.name, &record.tag);
        QueueMetrics::update_active(&self.config.name, active);
        debug!(
            job_id = %record.id,
            tag = %record.tag,
            attempts = record.attempts,
            "Dispatching job"
        );

        let span = info_span!("job", queue_id = %self.id, job_id = %record.id, tag = %record.tag);
        let inner = Arc::clone(self);
        tokio::spawn(inner.run(record).instrument(span));
    }

    /// Runs one dispatch to resolution, then frees its slot.
    async fn run(self: Arc<Self>, record: JobRecord) {
        let started = Instant::now();
        let (completion, receiver) = Completion::channel(record.id, record.attempts);

        // `process` may block, so it runs off the runtime workers and the
        // timeout below starts at dispatch.
        let job = record.job();
        let job_id = record.id;
        let handler = Arc::clone(&self.handler);
        tokio::task::spawn_blocking(move || {
            let process = AssertUnwindSafe(move || handler.process(job, completion));
            if std::panic::catch_unwind(process).is_err() {
                error!(job_id = %job_id, "Handler panicked");
            }
        });

        let resolution = match timeout(self.config.handler_timeout(), receiver).await {
            Ok(Ok(outcome)) => Resolution::Reported(outcome),
            Ok(Err(_)) => Resolution::Abandoned,
            Err(_) => Resolution::TimedOut,
        };

        self.resolve(&record, resolution, started.elapsed()).await;
        self.release(record.id).await;
    }

    async fn resolve(&self, record: &JobRecord, resolution: Resolution, elapsed: Duration) {
        match resolution {
            Resolution::Reported(JobOutcome::Success) => match self.store.remove(record.id).await {
                Ok(()) => {
                    self.succeeded.fetch_add(1, Ordering::Relaxed);
                    QueueMetrics::job_succeeded(&self.config.name, &record.tag, elapsed);
                    debug!(job_id = %record.id, tag = %record.tag, "Job succeeded");
                    self.emit(QueueEvent::JobSucceeded {
                        id: record.id,
                        tag: record.tag.clone(),
                        payload: record.payload.clone(),
                    });
                }
                Err(e) => self.storage_fault("remove", &e),
            },
            Resolution::Reported(JobOutcome::CriticalFailure) => {
                warn!(job_id = %record.id, tag = %record.tag, "Job failed critically, dropping");
                match self.store.remove(record.id).await {
                    Ok(()) => self.report_failure(record, FailureReason::Critical, false, elapsed),
                    Err(e) => self.storage_fault("remove", &e),
                }
            }
            Resolution::Reported(JobOutcome::RecoverableFailure) => {
                self.retry_later(record, FailureReason::Recoverable, elapsed).await;
            }
            Resolution::Abandoned => {
                warn!(job_id = %record.id, tag = %record.tag, "Handler gave up its completion");
                self.retry_later(record, FailureReason::Recoverable, elapsed).await;
            }
            Resolution::TimedOut => {
                warn!(
                    job_id = %record.id,
                    tag = %record.tag,
                    timeout_secs = self.config.handler_timeout_secs,
                    "Handler timed out"
                );
                QueueMetrics::job_timed_out(&self.config.name, &record.tag);
                self.retry_later(record, FailureReason::TimedOut, elapsed).await;
            }
        }
    }

    async fn retry_later(&self, record: &JobRecord, reason: FailureReason, elapsed: Duration) {
        match self.store.reschedule(record.id).await {
            Ok(RescheduleOutcome::Rescheduled {
                attempts,
                next_eligible_at,
            }) => {
                debug!(
                    job_id = %record.id,
                    attempts,
                    next_eligible_at = %next_eligible_at,
                    "Job rescheduled"
                );
                QueueMetrics::job_retried(&self.config.name, &record.tag, attempts);
                self.report_failure(record, reason, true, elapsed);
            }
            Ok(RescheduleOutcome::Removed { attempts }) => {
                let reason = if record.policy.is_exhausted(attempts) {
                    FailureReason::Exhausted
                } else {
                    FailureReason::Expired
                };
                warn!(job_id = %record.id, tag = %record.tag, attempts, %reason, "Job dropped");
                self.report_failure(record, reason, false, elapsed);
            }
            Ok(RescheduleOutcome::Missing) => {
                debug!(job_id = %record.id, "Job record removed while in flight");
                self.report_failure(record, reason, false, elapsed);
            }
            Err(e) => self.storage_fault("reschedule", &e),
        }
    }

    /// Removes a record whose expiration passed before dispatch. Returns
    /// false if the store failed.
    async fn discard_expired(&self, record: &JobRecord) -> bool {
        warn!(job_id = %record.id, tag = %record.tag, "Job expired before dispatch");
        match self.store.remove(record.id).await {
            Ok(()) => {
                self.report_failure(record, FailureReason::Expired, false, Duration::ZERO);
                true
            }
            Err(e) => {
                self.storage_fault("remove", &e);
                false
            }
        }
    }

    fn report_failure(
        &self,
        record: &JobRecord,
        reason: FailureReason,
        will_retry: bool,
        elapsed: Duration,
    ) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::job_failed(&self.config.name, &record.tag, reason.as_str(), elapsed);
        self.emit(QueueEvent::JobFailed {
            id: record.id,
            tag: record.tag.clone(),
            payload: record.payload.clone(),
            reason,
            will_retry,
        });
    }

    /// Drops the store reservation, then frees the slot. Runs after every
    /// resolution, including failed store updates.
    async fn release(&self, id: JobId) {
        self.store.release(id).await;

        let remaining = {
            let mut active = self.active.lock();
            active.remove(&id);
            active.len()
        };

        QueueMetrics::update_active(&self.config.name, remaining);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
        self.wake.notify_one();
    }

    /// Emits `Drained` once the store is empty and nothing is in flight,
    /// if work was seen since the last `Drained`.
    async fn check_drained(&self) {
        if !self.active.lock().is_empty() || !self.backlog_seen.load(Ordering::SeqCst) {
            return;
        }

        match self.store.count().await {
            Ok(0) => {}
            Ok(waiting) => {
                debug!(queue_id = %self.id, waiting, "No eligible jobs, records still waiting");
                return;
            }
            Err(e) => {
                self.storage_fault("count", &e);
                return;
            }
        }

        if self.backlog_seen.swap(false, Ordering::SeqCst) {
            info!(queue_id = %self.id, "Queue drained");
            self.emit(QueueEvent::Drained);
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn storage_fault(&self, operation: &'static str, err: &KeelError) {
        error!(queue_id = %self.id, operation, error = %err, "Store operation failed");
        QueueMetrics::storage_fault(&self.config.name, operation);
        self.emit(QueueEvent::StorageFault {
            operation,
            message: err.to_string(),
        });
    }

    fn emit(&self, event: QueueEvent) {
        debug!(queue_id = %self.id, event = event.name(), "Emitting event");
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}
