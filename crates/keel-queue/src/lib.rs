//! # Keel Queue
//!
//! An embeddable, persistent, at-least-once job queue.
//!
//! Jobs are stored durably before [`QueueEngine::enqueue`] returns. A
//! running engine polls the store, hands each eligible job to the single
//! registered [`JobHandler`], and applies the reported [`JobOutcome`]:
//! success removes the job, a recoverable failure reschedules it until its
//! attempts run out or it expires, and a critical failure drops it. A
//! crash mid-job simply leaves the job eligible again on the next start.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ enqueue ┌──────────────────────────────┐
//! │   Caller   │────────▶│          QueueEngine         │
//! └────────────┘         │  polling loop ─▶ active set  │
//!                        └───┬──────────────┬───────────┘
//!                            │ JobStore     │ process(job, completion)
//!                            ▼              ▼
//!                     ┌─────────────┐  ┌────────────┐
//!                     │ SQLite file │  │ JobHandler │
//!                     └─────────────┘  └────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use keel_queue::{handler_fn, Job, JobOutcome, QueueConfig, QueueEngine};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> keel_queue::KeelResult<()> {
//! let handler = handler_fn(|job| async move {
//!     println!("sending {}", job.payload());
//!     JobOutcome::Success
//! });
//!
//! let engine = QueueEngine::open(QueueConfig::default(), Arc::new(handler)).await?;
//! engine.enqueue(Job::new("email", json!({ "to": "user@example.com" }))).await?;
//! engine.start()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod handler;
pub mod metrics;
pub mod validation;

pub use config::{QueueConfig, RetryDefaults};
pub use engine::{QueueEngine, QueueStats};
pub use events::{FailureReason, QueueEvent};
pub use handler::{blocking_handler_fn, handler_fn, Completion, JobHandler};
pub use validation::ConfigValidationError;

pub use keel_core::telemetry::init_tracing;
pub use keel_core::{
    Job, JobId, JobOutcome, JobRecord, KeelError, KeelResult, RetryPolicy, TelemetryConfig,
};
pub use keel_store::{JobStore, SqliteJobStore, StoreConfig};
