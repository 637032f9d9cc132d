//! SQLite job store implementation.

use crate::pool::{self, StoreConfig};
use crate::traits::{JobStore, RescheduleOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keel_core::{Job, JobId, JobRecord, KeelError, KeelResult, RetryPolicy};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SELECT_COLUMNS: &str = "SELECT id, tag, payload, attempts, max_attempts, \
     retry_interval_ms, expires_at, created_at, next_eligible_at FROM jobs";

/// SQLite-backed job store.
///
/// Reads go straight to the pool. Mutations pass through a single write
/// gate so the store has exactly one writer.
///
/// `fetch_next` reserves the id it returns until the record is removed,
/// rescheduled, or released, so concurrent callers never receive the same
/// record. Reservations live in memory and do not survive a reopen.
pub struct SqliteJobStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
    /// Ids handed out by `fetch_next`. Held across the fetch query.
    claimed: Mutex<HashSet<JobId>>,
}

impl SqliteJobStore {
    /// Opens (or creates) the store described by `config`.
    pub async fn open(config: &StoreConfig) -> KeelResult<Self> {
        let pool = pool::connect(config).await?;
        Ok(Self::with_pool(pool))
    }

    /// Opens (or creates) the store at `path` with default pool settings.
    pub async fn open_path(path: impl AsRef<Path>) -> KeelResult<Self> {
        Self::open(&StoreConfig::at(path.as_ref())).await
    }

    /// Wraps an existing pool whose schema is already migrated.
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Mutex::new(()),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Closes the underlying pool.
    pub async fn close(&self) {
        info!("Closing job store...");
        self.pool.close().await;
    }

    /// Candidates ordered oldest first; at most `exclude.len() + 1` rows
    /// are needed to find one that is not excluded.
    async fn first_eligible(
        &self,
        tag: Option<&str>,
        exclude: &HashSet<JobId>,
    ) -> KeelResult<Option<JobRecord>> {
        let now = to_millis(Utc::now());
        let limit = i64::try_from(exclude.len()).unwrap_or(i64::MAX).saturating_add(1);

        let rows = match tag {
            Some(tag) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "{SELECT_COLUMNS} WHERE tag = ? AND next_eligible_at <= ? \
                     ORDER BY created_at, id LIMIT ?"
                ))
                .bind(tag)
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "{SELECT_COLUMNS} WHERE next_eligible_at <= ? ORDER BY created_at, id LIMIT ?"
                ))
                .bind(now)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter()
            .find(|row| !exclude.contains(&JobId::new(row.id)))
            .map(JobRecord::try_from)
            .transpose()
    }
}

/// Database row representation of a job.
#[derive(Debug, FromRow)]
struct JobRow {
    id: i64,
    tag: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    retry_interval_ms: i64,
    expires_at: Option<i64>,
    created_at: i64,
    next_eligible_at: i64,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = KeelError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |column: &str| {
            KeelError::Storage(format!("corrupt record {}: invalid {}", row.id, column))
        };

        let payload = serde_json::from_str(&row.payload).map_err(|_| corrupt("payload"))?;
        let attempts = u32::try_from(row.attempts).map_err(|_| corrupt("attempts"))?;
        let max_attempts = u32::try_from(row.max_attempts).map_err(|_| corrupt("max_attempts"))?;
        let retry_interval_ms =
            u64::try_from(row.retry_interval_ms).map_err(|_| corrupt("retry_interval_ms"))?;
        let expires_at = row
            .expires_at
            .map(|ms| from_millis(ms).ok_or_else(|| corrupt("expires_at")))
            .transpose()?;

        Ok(JobRecord {
            id: JobId::new(row.id),
            tag: row.tag.clone(),
            payload,
            policy: RetryPolicy {
                max_attempts,
                retry_interval: Duration::from_millis(retry_interval_ms),
                expires_at,
            },
            attempts,
            created_at: from_millis(row.created_at).ok_or_else(|| corrupt("created_at"))?,
            next_eligible_at: from_millis(row.next_eligible_at)
                .ok_or_else(|| corrupt("next_eligible_at"))?,
        })
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, job: &Job, policy: &RetryPolicy) -> KeelResult<JobId> {
        let payload = serde_json::to_string(job.payload())?;
        let now = to_millis(Utc::now());
        let retry_interval_ms =
            i64::try_from(policy.retry_interval.as_millis()).unwrap_or(i64::MAX);

        let _write = self.write_gate.lock().await;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (tag, payload, attempts, max_attempts, retry_interval_ms,
                              expires_at, created_at, next_eligible_at)
            VALUES (?, ?, 0, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.tag())
        .bind(payload)
        .bind(i64::from(policy.max_attempts))
        .bind(retry_interval_ms)
        .bind(policy.expires_at.map(to_millis))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = JobId::new(result.last_insert_rowid());
        debug!(job_id = %id, tag = %job.tag(), "Created job record");
        Ok(id)
    }

    async fn exists(&self, tag: &str) -> KeelResult<bool> {
        let result: Option<i32> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE tag = ? LIMIT 1")
            .bind(tag)
            .fetch_optional(&self.pool)
            .await?;

        Ok(result.is_some())
    }

    async fn count(&self) -> KeelResult<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;

        Ok(u64::try_from(total).unwrap_or_default())
    }

    async fn fetch_next(&self, exclude: &HashSet<JobId>) -> KeelResult<Option<JobRecord>> {
        let mut claimed = self.claimed.lock().await;
        let skip: HashSet<JobId> = exclude.iter().chain(claimed.iter()).copied().collect();

        let record = self.first_eligible(None, &skip).await?;
        if let Some(record) = &record {
            claimed.insert(record.id);
            debug!(job_id = %record.id, "Claimed job record");
        }
        Ok(record)
    }

    async fn fetch_next_for_tag(
        &self,
        tag: &str,
        exclude: &HashSet<JobId>,
    ) -> KeelResult<Option<JobRecord>> {
        self.first_eligible(Some(tag), exclude).await
    }

    async fn reschedule(&self, id: JobId) -> KeelResult<RescheduleOutcome> {
        let _write = self.write_gate.lock().await;
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.into_inner())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            self.claimed.lock().await.remove(&id);
            return Ok(RescheduleOutcome::Missing);
        };

        let record = JobRecord::try_from(row)?;
        let attempts = record.attempts.saturating_add(1);
        let now = Utc::now();

        let outcome = if record.policy.is_terminal(attempts, now) {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(id.into_inner())
                .execute(&mut *tx)
                .await?;
            RescheduleOutcome::Removed { attempts }
        } else {
            let next_eligible_at = record.policy.next_eligible_after(now, record.next_eligible_at);
            sqlx::query("UPDATE jobs SET attempts = ?, next_eligible_at = ? WHERE id = ?")
                .bind(i64::from(attempts))
                .bind(to_millis(next_eligible_at))
                .bind(id.into_inner())
                .execute(&mut *tx)
                .await?;
            RescheduleOutcome::Rescheduled {
                attempts,
                next_eligible_at,
            }
        };

        tx.commit().await?;
        self.claimed.lock().await.remove(&id);
        debug!(job_id = %id, attempts, outcome = ?outcome, "Rescheduled job record");
        Ok(outcome)
    }

    async fn remove(&self, id: JobId) -> KeelResult<()> {
        let _write = self.write_gate.lock().await;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.into_inner())
            .execute(&self.pool)
            .await?;
        self.claimed.lock().await.remove(&id);

        debug!(job_id = %id, "Removed job record");
        Ok(())
    }

    async fn remove_all(&self) -> KeelResult<u64> {
        let _write = self.write_gate.lock().await;
        let result = sqlx::query("DELETE FROM jobs").execute(&self.pool).await?;
        self.claimed.lock().await.clear();

        info!(removed = result.rows_affected(), "Removed all job records");
        Ok(result.rows_affected())
    }

    async fn release(&self, id: JobId) {
        if self.claimed.lock().await.remove(&id) {
            debug!(job_id = %id, "Released job record");
        }
    }

    async fn get(&self, id: JobId) -> KeelResult<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn health_check(&self) -> KeelResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| KeelError::Storage(format!("Health check failed: {}", e)))?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .finish()
    }
}
