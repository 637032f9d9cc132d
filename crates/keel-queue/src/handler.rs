//! Handler contract.
//!
//! The engine hands every dispatched job to exactly one [`JobHandler`]
//! together with a single-use [`Completion`]. The handler may report the
//! outcome right away or from any task later on; the engine waits for it
//! (bounded by the handler timeout) without holding any lock.

use futures::future::BoxFuture;
use keel_core::{Job, JobId, JobOutcome};
use std::future::Future;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Performs the work behind a job.
pub trait JobHandler: Send + Sync + 'static {
    /// Processes `job` and eventually reports through `completion`.
    ///
    /// Called once per dispatch on the blocking thread pool, with the
    /// runtime entered, so `process` may block or spawn tasks. The handler
    /// timeout starts at dispatch; a late report is ignored.
    fn process(&self, job: Job, completion: Completion);
}

/// Single-use outcome reporter for one dispatch.
///
/// Dropping a `Completion` without calling [`complete`](Self::complete)
/// counts as a recoverable failure.
#[must_use = "a dropped completion is treated as a recoverable failure"]
pub struct Completion {
    job_id: JobId,
    attempts: u32,
    sender: Option<oneshot::Sender<JobOutcome>>,
}

impl Completion {
    pub(crate) fn channel(job_id: JobId, attempts: u32) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (sender, receiver) = oneshot::channel();
        let completion = Self {
            job_id,
            attempts,
            sender: Some(sender),
        };
        (completion, receiver)
    }

    /// Store id of the dispatched job.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Failed attempts before this dispatch.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Reports the outcome.
    pub fn complete(mut self, outcome: JobOutcome) {
        if let Some(sender) = self.sender.take() {
            if sender.send(outcome).is_err() {
                debug!(
                    job_id = %self.job_id,
                    %outcome,
                    "Outcome reported after the dispatch was already resolved"
                );
            }
        }
    }

    /// Reports success.
    pub fn success(self) {
        self.complete(JobOutcome::Success);
    }

    /// Reports a recoverable failure.
    pub fn retry(self) {
        self.complete(JobOutcome::RecoverableFailure);
    }

    /// Reports a critical failure.
    pub fn critical(self) {
        self.complete(JobOutcome::CriticalFailure);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.sender.is_some() {
            warn!(job_id = %self.job_id, "Completion dropped without an outcome");
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("job_id", &self.job_id)
            .field("attempts", &self.attempts)
            .field("reported", &self.sender.is_none())
            .finish()
    }
}

/// Boxed async handler function.
type AsyncHandlerFn = Box<dyn Fn(Job) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// Handler built from an async function. See [`handler_fn`].
pub struct AsyncHandler {
    handler: AsyncHandlerFn,
}

impl JobHandler for AsyncHandler {
    fn process(&self, job: Job, completion: Completion) {
        let future = (self.handler)(job);
        tokio::spawn(async move {
            completion.complete(future.await);
        });
    }
}

/// Wraps an async function as a handler.
///
/// Each dispatch runs the returned future on its own task and reports its
/// output. A panicking future drops the completion, so the job is retried.
///
/// # Example
///
/// ```rust,no_run
/// use keel_queue::{handler_fn, JobOutcome};
///
/// let handler = handler_fn(|job| async move {
///     match job.tag() {
///         "email" => JobOutcome::Success,
///         _ => JobOutcome::CriticalFailure,
///     }
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> AsyncHandler
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    AsyncHandler {
        handler: Box::new(move |job| Box::pin(f(job))),
    }
}

/// Boxed synchronous handler function.
type BlockingHandlerFn = Box<dyn Fn(Job) -> JobOutcome + Send + Sync>;

/// Handler built from a synchronous function. See [`blocking_handler_fn`].
pub struct BlockingHandler {
    handler: BlockingHandlerFn,
}

impl JobHandler for BlockingHandler {
    fn process(&self, job: Job, completion: Completion) {
        completion.complete((self.handler)(job));
    }
}

/// Wraps a synchronous function as a handler.
///
/// The function runs on the blocking thread pool and its return value is
/// reported as soon as it returns. A call that outlives the handler timeout
/// is resolved as timed out; its late result is ignored.
pub fn blocking_handler_fn<F>(f: F) -> BlockingHandler
where
    F: Fn(Job) -> JobOutcome + Send + Sync + 'static,
{
    BlockingHandler {
        handler: Box::new(f),
    }
}
