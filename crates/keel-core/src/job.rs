//! Job value types.

use crate::error::KeelError;
use crate::result::KeelResult;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Store-assigned job identifier.
///
/// Ids are handed out by the store on creation and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl JobId {
    /// Wraps a raw store id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    pub const fn into_inner(self) -> i64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// A unit of work to enqueue.
///
/// A `Job` is an immutable description: a tag naming the kind of work, an
/// opaque payload the queue never inspects, and optional retry overrides.
/// Everything that changes over the job's lifetime (id, attempts,
/// eligibility) lives in the persisted [`JobRecord`].
///
/// # Example
///
/// ```rust
/// use keel_core::Job;
/// use serde_json::json;
/// use std::time::Duration;
///
/// let job = Job::new("email", json!({ "to": "user@example.com" }))
///     .max_attempts(3)
///     .retry_interval(Duration::from_secs(5));
///
/// assert_eq!(job.tag(), "email");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    tag: String,
    payload: Value,
    pub(crate) max_attempts: Option<u32>,
    pub(crate) retry_interval: Option<Duration>,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a job with the given tag and payload.
    pub fn new(tag: impl Into<String>, payload: Value) -> Self {
        Self {
            tag: tag.into(),
            payload,
            max_attempts: None,
            retry_interval: None,
            expires_at: None,
        }
    }

    /// Creates a job whose payload is the JSON form of `payload`.
    pub fn from_payload<T: Serialize>(tag: impl Into<String>, payload: &T) -> KeelResult<Self> {
        Ok(Self::new(tag, serde_json::to_value(payload)?))
    }

    /// Overrides the maximum number of attempts (0 = unlimited).
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Overrides the delay before a failed attempt is retried.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    /// Discards the job instead of retrying once `at` has passed.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Discards the job instead of retrying once `ttl` has elapsed from now.
    pub fn expires_in(self, ttl: Duration) -> Self {
        let ttl = ChronoDuration::from_std(ttl).unwrap_or(ChronoDuration::MAX);
        let at = Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.expires_at(at)
    }

    /// Work-type identifier.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Opaque payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Deserializes the payload into `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> KeelResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Per-job attempt override, if any.
    pub fn max_attempts_override(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Per-job retry interval override, if any.
    pub fn retry_interval_override(&self) -> Option<Duration> {
        self.retry_interval
    }

    /// Expiration instant, if any.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Rejects jobs the queue cannot accept.
    pub fn validate(&self) -> KeelResult<()> {
        if self.tag.trim().is_empty() {
            return Err(KeelError::validation("job tag must not be empty"));
        }
        Ok(())
    }
}

/// A job as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Store-assigned id.
    pub id: JobId,

    /// Work-type identifier.
    pub tag: String,

    /// Opaque payload.
    pub payload: Value,

    /// Effective retry policy, resolved at creation.
    pub policy: RetryPolicy,

    /// Recoverable failures so far.
    pub attempts: u32,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// Earliest instant the record may be dispatched.
    pub next_eligible_at: DateTime<Utc>,
}

impl JobRecord {
    /// Reconstructs the job handed to the handler.
    ///
    /// Overrides are filled from the persisted policy, so the handler sees
    /// the values actually in force.
    pub fn job(&self) -> Job {
        Job {
            tag: self.tag.clone(),
            payload: self.payload.clone(),
            max_attempts: Some(self.policy.max_attempts),
            retry_interval: Some(self.policy.retry_interval),
            expires_at: self.policy.expires_at,
        }
    }

    /// Returns true if the record may be dispatched at `now`.
    pub fn is_eligible_at(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }

    /// Returns true if the record's expiration has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.policy.is_expired_at(now)
    }

    /// Returns true if no attempts remain.
    pub fn is_exhausted(&self) -> bool {
        self.policy.is_exhausted(self.attempts)
    }
}

/// Outcome a handler reports for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// The job finished; its record is removed.
    Success,
    /// The job failed but may succeed later; it is rescheduled.
    RecoverableFailure,
    /// The job can never succeed; its record is removed.
    CriticalFailure,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success => write!(f, "success"),
            JobOutcome::RecoverableFailure => write!(f, "recoverable_failure"),
            JobOutcome::CriticalFailure => write!(f, "critical_failure"),
        }
    }
}
