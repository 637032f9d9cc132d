//! Metrics for queue monitoring.
//!
//! Recorded through the `metrics` facade; install any recorder in the host
//! application to export them.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "keel_jobs_enqueued_total";
    /// Total jobs handed to the handler.
    pub const JOBS_DISPATCHED_TOTAL: &str = "keel_jobs_dispatched_total";
    /// Total jobs completed successfully.
    pub const JOBS_SUCCEEDED_TOTAL: &str = "keel_jobs_succeeded_total";
    /// Total failed attempts that were rescheduled.
    pub const JOBS_RETRIED_TOTAL: &str = "keel_jobs_retried_total";
    /// Total failed dispatches, by reason.
    pub const JOBS_FAILED_TOTAL: &str = "keel_jobs_failed_total";
    /// Total handler timeouts.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "keel_jobs_timed_out_total";
    /// Total store operations that failed.
    pub const STORAGE_FAULTS_TOTAL: &str = "keel_storage_faults_total";

    /// Jobs currently dispatched.
    pub const JOBS_ACTIVE: &str = "keel_jobs_active";

    /// Time from dispatch to resolution in seconds.
    pub const JOB_DURATION_SECONDS: &str = "keel_job_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_DISPATCHED_TOTAL,
        "Total number of jobs dispatched to the handler"
    );
    describe_counter!(
        names::JOBS_SUCCEEDED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed attempts rescheduled for retry"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed dispatches");
    describe_counter!(
        names::JOBS_TIMED_OUT_TOTAL,
        "Total number of handler invocations that timed out"
    );
    describe_counter!(
        names::STORAGE_FAULTS_TOTAL,
        "Total number of failed store operations"
    );

    describe_gauge!(names::JOBS_ACTIVE, "Current number of dispatched jobs");

    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Time from dispatch to resolution in seconds"
    );
}

/// Queue metrics recorder.
#[derive(Clone)]
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, tag: &str) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "tag" => tag.to_string()
        )
        .increment(1);
    }

    /// Record a job dispatched.
    pub fn job_dispatched(queue: &str, tag: &str) {
        counter!(
            names::JOBS_DISPATCHED_TOTAL,
            "queue" => queue.to_string(),
            "tag" => tag.to_string()
        )
        .increment(1);
    }

    /// Record a job succeeded.
    pub fn job_succeeded(queue: &str, tag: &str, duration: Duration) {
        counter!(
            names::JOBS_SUCCEEDED_TOTAL,
            "queue" => queue.to_string(),
            "tag" => tag.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "tag" => tag.to_string(),
            "status" => "succeeded"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed dispatch.
    pub fn job_failed(queue: &str, tag: &str, reason: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "tag" => tag.to_string(),
            "reason" => reason.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "tag" => tag.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job rescheduled.
    pub fn job_retried(queue: &str, tag: &str, attempts: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "tag" => tag.to_string(),
            "attempt" => attempts.to_string()
        )
        .increment(1);
    }

    /// Record a handler timeout.
    pub fn job_timed_out(queue: &str, tag: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "queue" => queue.to_string(),
            "tag" => tag.to_string()
        )
        .increment(1);
    }

    /// Record a failed store operation.
    pub fn storage_fault(queue: &str, operation: &'static str) {
        counter!(
            names::STORAGE_FAULTS_TOTAL,
            "queue" => queue.to_string(),
            "operation" => operation
        )
        .increment(1);
    }

    /// Update the active gauge.
    pub fn update_active(queue: &str, active: usize) {
        gauge!(
            names::JOBS_ACTIVE,
            "queue" => queue.to_string()
        )
        .set(active as f64);
    }
}
