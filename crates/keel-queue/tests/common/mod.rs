//! Common test infrastructure for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use keel_queue::{
    Completion, Job, JobHandler, JobId, JobRecord, JobStore, KeelError, KeelResult, QueueConfig,
    QueueEvent, RetryPolicy, SqliteJobStore, StoreConfig,
};
use keel_store::RescheduleOutcome;
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Fast-ticking config for a store inside `dir`.
pub fn test_config(dir: &Path) -> QueueConfig {
    let mut config = QueueConfig::default();
    config.poll_interval_ms = 20;
    config.handler_timeout_secs = 5;
    config.shutdown_timeout_secs = 5;
    config.retry.retry_interval_ms = 0;
    config.store = StoreConfig::at(dir.join("jobs.db"));
    config
}

/// Temp directory plus a store opened inside it.
pub async fn temp_store() -> (TempDir, Arc<SqliteJobStore>) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let store = open_store(dir.path()).await;
    (dir, store)
}

/// Opens the store file inside `dir`.
pub async fn open_store(dir: &Path) -> Arc<SqliteJobStore> {
    let store = SqliteJobStore::open(&StoreConfig::at(dir.join("jobs.db")))
        .await
        .expect("Failed to open store");
    Arc::new(store)
}

/// Handler that hands every dispatch to the test instead of resolving it.
pub struct HoldingHandler {
    tx: mpsc::UnboundedSender<(Job, Completion)>,
}

impl HoldingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(Job, Completion)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl JobHandler for HoldingHandler {
    fn process(&self, job: Job, completion: Completion) {
        let _ = self.tx.send((job, completion));
    }
}

/// Receives the next held dispatch.
pub async fn next_dispatch(
    rx: &mut mpsc::UnboundedReceiver<(Job, Completion)>,
) -> (Job, Completion) {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("Timed out waiting for a dispatch")
        .expect("Handler channel closed")
}

/// Waits for the first event matching `predicate`, skipping others.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<QueueEvent>, predicate: F) -> QueueEvent
where
    F: Fn(&QueueEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("Event channel closed"),
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

/// Polls `condition` until it holds.
pub async fn wait_until<F, Fut>(condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for condition");
}

/// Store wrapper whose fetches and updates can be made to fail.
pub struct FaultyStore {
    inner: Arc<SqliteJobStore>,
    fail_fetch: AtomicBool,
    fail_remove: AtomicBool,
    fail_reschedule: AtomicBool,
}

impl FaultyStore {
    pub fn new(inner: Arc<SqliteJobStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_fetch: AtomicBool::new(false),
            fail_remove: AtomicBool::new(false),
            fail_reschedule: AtomicBool::new(false),
        })
    }

    /// Makes `fetch_next` and `fetch_next_for_tag` fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_fetch.store(failing, Ordering::SeqCst);
    }

    pub fn set_remove_failing(&self, failing: bool) {
        self.fail_remove.store(failing, Ordering::SeqCst);
    }

    pub fn set_reschedule_failing(&self, failing: bool) {
        self.fail_reschedule.store(failing, Ordering::SeqCst);
    }

    fn check(switch: &AtomicBool) -> KeelResult<()> {
        if switch.load(Ordering::SeqCst) {
            return Err(KeelError::storage("disk I/O error"));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FaultyStore {
    async fn create(&self, job: &Job, policy: &RetryPolicy) -> KeelResult<JobId> {
        self.inner.create(job, policy).await
    }

    async fn exists(&self, tag: &str) -> KeelResult<bool> {
        self.inner.exists(tag).await
    }

    async fn count(&self) -> KeelResult<u64> {
        self.inner.count().await
    }

    async fn fetch_next(&self, exclude: &HashSet<JobId>) -> KeelResult<Option<JobRecord>> {
        Self::check(&self.fail_fetch)?;
        self.inner.fetch_next(exclude).await
    }

    async fn fetch_next_for_tag(
        &self,
        tag: &str,
        exclude: &HashSet<JobId>,
    ) -> KeelResult<Option<JobRecord>> {
        Self::check(&self.fail_fetch)?;
        self.inner.fetch_next_for_tag(tag, exclude).await
    }

    async fn reschedule(&self, id: JobId) -> KeelResult<RescheduleOutcome> {
        Self::check(&self.fail_reschedule)?;
        self.inner.reschedule(id).await
    }

    async fn remove(&self, id: JobId) -> KeelResult<()> {
        Self::check(&self.fail_remove)?;
        self.inner.remove(id).await
    }

    async fn release(&self, id: JobId) {
        self.inner.release(id).await;
    }

    async fn remove_all(&self) -> KeelResult<u64> {
        self.inner.remove_all().await
    }

    async fn get(&self, id: JobId) -> KeelResult<Option<JobRecord>> {
        self.inner.get(id).await
    }

    async fn health_check(&self) -> KeelResult<()> {
        self.inner.health_check().await
    }
}
