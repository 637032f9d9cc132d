//! Store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Job, JobId, JobRecord, KeelResult, RetryPolicy};
use std::collections::HashSet;

/// Result of a [`JobStore::reschedule`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleOutcome {
    /// The record stays and becomes eligible again at `next_eligible_at`.
    Rescheduled {
        attempts: u32,
        next_eligible_at: DateTime<Utc>,
    },
    /// Attempts were exhausted or the job expired; the record was deleted.
    Removed { attempts: u32 },
    /// No record with that id exists (already removed).
    Missing,
}

impl RescheduleOutcome {
    /// Returns true if the record was permanently deleted by this call.
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed { .. })
    }
}

/// Durable record of jobs that have not completed yet.
///
/// Every operation either happens entirely or not at all; a process kill at
/// any point leaves the store consistent. Any operation may fail with
/// [`KeelError::Storage`](keel_core::KeelError::Storage).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new record with zero attempts, eligible immediately.
    async fn create(&self, job: &Job, policy: &RetryPolicy) -> KeelResult<JobId>;

    /// Checks whether any record carries `tag`.
    async fn exists(&self, tag: &str) -> KeelResult<bool>;

    /// Counts all records.
    async fn count(&self) -> KeelResult<u64>;

    /// Returns the oldest eligible record whose id is not in `exclude`.
    ///
    /// The returned id is reserved: no other `fetch_next` call returns it
    /// until it is removed, rescheduled, or [released](Self::release).
    async fn fetch_next(&self, exclude: &HashSet<JobId>) -> KeelResult<Option<JobRecord>>;

    /// Returns the oldest eligible record with `tag` whose id is not in
    /// `exclude`. Reserves nothing and ignores reservations.
    async fn fetch_next_for_tag(
        &self,
        tag: &str,
        exclude: &HashSet<JobId>,
    ) -> KeelResult<Option<JobRecord>>;

    /// Records one more failed attempt.
    ///
    /// Deletes the record instead when the attempt budget is spent or the
    /// expiration has passed.
    async fn reschedule(&self, id: JobId) -> KeelResult<RescheduleOutcome>;

    /// Deletes a record. Removing an absent id is not an error.
    async fn remove(&self, id: JobId) -> KeelResult<()>;

    /// Drops the reservation on `id` without touching the record.
    async fn release(&self, id: JobId);

    /// Deletes every record, returning how many were removed.
    async fn remove_all(&self) -> KeelResult<u64>;

    /// Finds a record by id.
    async fn get(&self, id: JobId) -> KeelResult<Option<JobRecord>>;

    /// Checks that the underlying storage is reachable.
    async fn health_check(&self) -> KeelResult<()>;
}
