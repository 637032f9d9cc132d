//! Lifecycle notifications.
//!
//! Observers subscribe through [`QueueEngine::subscribe`](crate::QueueEngine::subscribe)
//! and receive every event emitted after they subscribed, in the order the
//! engine performed the transitions.

use keel_core::JobId;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Why a dispatch did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Handler reported a recoverable failure, or dropped its completion.
    Recoverable,
    /// Handler reported the job can never succeed.
    Critical,
    /// Handler did not report before the timeout.
    TimedOut,
    /// Recoverable failure on the last allowed attempt.
    Exhausted,
    /// Expiration passed before the job could succeed.
    Expired,
}

impl FailureReason {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recoverable => "recoverable",
            Self::Critical => "critical",
            Self::TimedOut => "timed_out",
            Self::Exhausted => "exhausted",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event emitted by a queue engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The polling loop started.
    Started,

    /// The polling loop stopped.
    Stopped,

    /// A job finished and its record was removed.
    JobSucceeded {
        id: JobId,
        tag: String,
        payload: Value,
    },

    /// A dispatch failed. `will_retry` tells whether the record is still stored.
    JobFailed {
        id: JobId,
        tag: String,
        payload: Value,
        reason: FailureReason,
        will_retry: bool,
    },

    /// The store is empty and nothing is in flight.
    Drained,

    /// A store operation failed; the loop keeps running.
    StorageFault {
        operation: &'static str,
        message: String,
    },
}

impl QueueEvent {
    /// Short event name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::JobSucceeded { .. } => "job_succeeded",
            Self::JobFailed { .. } => "job_failed",
            Self::Drained => "drained",
            Self::StorageFault { .. } => "storage_fault",
        }
    }

    /// Job id the event refers to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobSucceeded { id, .. } | Self::JobFailed { id, .. } => Some(*id),
            _ => None,
        }
    }
}
