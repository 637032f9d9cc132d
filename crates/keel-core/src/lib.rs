//! # Keel Core
//!
//! Value types shared by the keel job queue: the [`Job`] a caller
//! enqueues, the [`JobRecord`] the store persists, the [`RetryPolicy`]
//! that decides when a failed job is retried or dropped, and the unified
//! [`KeelError`].

pub mod error;
pub mod job;
pub mod result;
pub mod retry;
pub mod telemetry;

pub use error::*;
pub use job::*;
pub use result::*;
pub use retry::*;
pub use telemetry::TelemetryConfig;
