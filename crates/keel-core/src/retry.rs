//! Retry policies for failed jobs.

use crate::job::Job;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of attempts before a job is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default delay before a failed job becomes eligible again.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Retry policy persisted alongside each job.
///
/// The interval is fixed: every recoverable failure pushes the job's
/// eligibility out by the same `retry_interval`. Bounded retry windows are
/// expressed through `max_attempts` and `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 = unlimited).
    pub max_attempts: u32,

    /// Minimum delay before a failed job is eligible again.
    #[serde(with = "duration_millis")]
    pub retry_interval: Duration,

    /// Instant after which the job is discarded instead of retried.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_INTERVAL)
    }
}

impl RetryPolicy {
    /// Creates a policy that retries forever at the given interval.
    pub fn unlimited(retry_interval: Duration) -> Self {
        Self::fixed(0, retry_interval)
    }

    /// Creates a fixed-interval retry policy.
    pub fn fixed(max_attempts: u32, retry_interval: Duration) -> Self {
        Self {
            max_attempts,
            retry_interval,
            expires_at: None,
        }
    }

    /// Sets the expiration instant.
    pub fn with_expiration(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Builds the effective policy for `job`, falling back to `defaults`
    /// for every override the job leaves unset.
    pub fn resolve(job: &Job, defaults: &RetryPolicy) -> Self {
        Self {
            max_attempts: job.max_attempts.unwrap_or(defaults.max_attempts),
            retry_interval: job.retry_interval.unwrap_or(defaults.retry_interval),
            expires_at: job.expires_at.or(defaults.expires_at),
        }
    }

    /// Returns true if the attempt budget is unbounded.
    pub fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Returns true once `attempts` has used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        !self.is_unlimited() && attempts >= self.max_attempts
    }

    /// Returns true if `now` is past the expiration instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now > expires_at)
    }

    /// Returns true if a job with `attempts` failures must be dropped.
    pub fn is_terminal(&self, attempts: u32, now: DateTime<Utc>) -> bool {
        self.is_exhausted(attempts) || self.is_expired_at(now)
    }

    /// Next eligibility instant after a failure at `now`.
    ///
    /// Never earlier than `previous`.
    pub fn next_eligible_after(
        &self,
        now: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = ChronoDuration::from_std(self.retry_interval).unwrap_or(ChronoDuration::MAX);
        let candidate = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        candidate.max(previous)
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
