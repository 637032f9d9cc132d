//! Integration tests for SqliteJobStore.
//!
//! These tests run against a real SQLite file in a temporary directory.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::TestStore;
use keel_core::{Job, JobId, RetryPolicy};
use keel_store::{JobStore, RescheduleOutcome};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn immediate(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::ZERO)
}

fn none() -> HashSet<JobId> {
    HashSet::new()
}

#[tokio::test]
async fn test_create_count_and_exists() {
    let db = TestStore::new().await;
    let store = db.store();

    assert_eq!(store.count().await.unwrap(), 0);
    assert!(!store.exists("email").await.unwrap());

    store.create(&Job::new("email", json!({"to": "x"})), &immediate(3)).await.unwrap();
    store.create(&Job::new("sync", json!(null)), &immediate(3)).await.unwrap();

    assert_eq!(store.count().await.unwrap(), 2);
    assert!(store.exists("email").await.unwrap());
    assert!(store.exists("sync").await.unwrap());
    assert!(!store.exists("upload").await.unwrap());
}

#[tokio::test]
async fn test_create_persists_fields() {
    let db = TestStore::new().await;
    let store = db.store();
    let expires_at = Utc::now() + ChronoDuration::hours(1);

    let policy = RetryPolicy::fixed(3, Duration::from_secs(5)).with_expiration(expires_at);
    let id = store.create(&Job::new("email", json!({"to": "x"})), &policy).await.unwrap();

    let record = store.get(id).await.unwrap().expect("record not found");
    assert_eq!(record.id, id);
    assert_eq!(record.tag, "email");
    assert_eq!(record.payload, json!({"to": "x"}));
    assert_eq!(record.attempts, 0);
    assert_eq!(record.policy.max_attempts, 3);
    assert_eq!(record.policy.retry_interval, Duration::from_secs(5));
    assert_eq!(
        record.policy.expires_at.map(|t| t.timestamp_millis()),
        Some(expires_at.timestamp_millis())
    );
    assert_eq!(record.created_at, record.next_eligible_at);
}

#[tokio::test]
async fn test_fetch_next_is_fifo() {
    let db = TestStore::new().await;
    let store = db.store();

    let a = store.create(&Job::new("email", json!(1)), &immediate(3)).await.unwrap();
    let b = store.create(&Job::new("email", json!(2)), &immediate(3)).await.unwrap();

    assert_eq!(store.fetch_next(&none()).await.unwrap().unwrap().id, a);
    assert_eq!(store.fetch_next_for_tag("email", &none()).await.unwrap().unwrap().id, a);

    let exclude: HashSet<JobId> = [a].into_iter().collect();
    assert_eq!(store.fetch_next(&exclude).await.unwrap().unwrap().id, b);
}

#[tokio::test]
async fn test_fetch_next_for_tag_filters() {
    let db = TestStore::new().await;
    let store = db.store();

    store.create(&Job::new("email", json!(1)), &immediate(3)).await.unwrap();
    let sync = store.create(&Job::new("sync", json!(2)), &immediate(3)).await.unwrap();

    let record = store.fetch_next_for_tag("sync", &none()).await.unwrap().unwrap();
    assert_eq!(record.id, sync);
    assert!(store.fetch_next_for_tag("upload", &none()).await.unwrap().is_none());

    let exclude: HashSet<JobId> = [sync].into_iter().collect();
    assert!(store.fetch_next_for_tag("sync", &exclude).await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_skips_every_excluded_id() {
    let db = TestStore::new().await;
    let store = db.store();

    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(store.create(&Job::new("email", json!(n)), &immediate(3)).await.unwrap());
    }

    let exclude: HashSet<JobId> = ids[..4].iter().copied().collect();
    assert_eq!(store.fetch_next(&exclude).await.unwrap().unwrap().id, ids[4]);

    let all: HashSet<JobId> = ids.iter().copied().collect();
    assert!(store.fetch_next(&all).await.unwrap().is_none());
}

#[tokio::test]
async fn test_rescheduled_job_waits_for_interval() {
    let db = TestStore::new().await;
    let store = db.store();

    let policy = RetryPolicy::fixed(5, Duration::from_secs(60));
    let id = store.create(&Job::new("email", json!(null)), &policy).await.unwrap();

    match store.reschedule(id).await.unwrap() {
        RescheduleOutcome::Rescheduled { attempts, next_eligible_at } => {
            assert_eq!(attempts, 1);
            assert!(next_eligible_at > Utc::now() + ChronoDuration::seconds(50));
        }
        other => panic!("Expected Rescheduled, got {other:?}"),
    }

    assert_eq!(store.count().await.unwrap(), 1);
    assert!(store.fetch_next(&none()).await.unwrap().is_none());
    assert!(store.fetch_next_for_tag("email", &none()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_reschedule_attempts_are_monotonic() {
    let db = TestStore::new().await;
    let store = db.store();

    let id = store.create(&Job::new("email", json!(null)), &immediate(0)).await.unwrap();

    let mut previous_eligible = store.get(id).await.unwrap().unwrap().next_eligible_at;
    for expected in 1..=5u32 {
        let outcome = store.reschedule(id).await.unwrap();
        assert!(matches!(
            outcome,
            RescheduleOutcome::Rescheduled { attempts, .. } if attempts == expected
        ));

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.attempts, expected);
        assert!(record.next_eligible_at >= previous_eligible);
        previous_eligible = record.next_eligible_at;
    }
}

#[tokio::test]
async fn test_reschedule_removes_exhausted_job() {
    let db = TestStore::new().await;
    let store = db.store();

    let id = store.create(&Job::new("email", json!({"to": "x"})), &immediate(3)).await.unwrap();

    assert!(matches!(
        store.reschedule(id).await.unwrap(),
        RescheduleOutcome::Rescheduled { attempts: 1, .. }
    ));
    assert!(matches!(
        store.reschedule(id).await.unwrap(),
        RescheduleOutcome::Rescheduled { attempts: 2, .. }
    ));
    assert_eq!(store.reschedule(id).await.unwrap(), RescheduleOutcome::Removed { attempts: 3 });

    assert!(store.get(id).await.unwrap().is_none());
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(store.reschedule(id).await.unwrap(), RescheduleOutcome::Missing);
}

#[tokio::test]
async fn test_reschedule_removes_expired_job() {
    let db = TestStore::new().await;
    let store = db.store();

    let policy = RetryPolicy::unlimited(Duration::ZERO)
        .with_expiration(Utc::now() - ChronoDuration::seconds(1));
    let id = store.create(&Job::new("email", json!(null)), &policy).await.unwrap();

    assert_eq!(store.reschedule(id).await.unwrap(), RescheduleOutcome::Removed { attempts: 1 });
    assert!(!store.exists("email").await.unwrap());
}

#[tokio::test]
async fn test_unlimited_job_is_never_removed_by_reschedule() {
    let db = TestStore::new().await;
    let store = db.store();

    let id = store.create(&Job::new("email", json!(null)), &immediate(0)).await.unwrap();
    for _ in 0..20 {
        assert!(!store.reschedule(id).await.unwrap().is_removed());
    }
    assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 20);
}

#[tokio::test]
async fn test_remove_is_idempotent() {
    let db = TestStore::new().await;
    let store = db.store();

    let keep = store.create(&Job::new("email", json!(1)), &immediate(3)).await.unwrap();
    let gone = store.create(&Job::new("email", json!(2)), &immediate(3)).await.unwrap();

    store.remove(gone).await.unwrap();
    store.remove(gone).await.unwrap();
    store.remove(JobId::new(9_999)).await.unwrap();

    assert_eq!(store.count().await.unwrap(), 1);
    assert!(store.get(keep).await.unwrap().is_some());
}

#[tokio::test]
async fn test_remove_all() {
    let db = TestStore::new().await;
    let store = db.store();

    for n in 0..3 {
        store.create(&Job::new("email", json!(n)), &immediate(3)).await.unwrap();
    }

    assert_eq!(store.remove_all().await.unwrap(), 3);
    assert_eq!(store.count().await.unwrap(), 0);
    assert_eq!(store.remove_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_ids_are_never_reused() {
    let db = TestStore::new().await;
    let store = db.store();

    let first = store.create(&Job::new("email", json!(1)), &immediate(3)).await.unwrap();
    store.remove_all().await.unwrap();
    let second = store.create(&Job::new("email", json!(2)), &immediate(3)).await.unwrap();

    assert!(second > first);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let db = TestStore::new().await;

    let id = db
        .store()
        .create(&Job::new("email", json!({"to": "x"})), &immediate(3))
        .await
        .unwrap();
    db.store().reschedule(id).await.unwrap();

    let db = db.reopen().await;
    let record = db.store().get(id).await.unwrap().expect("record lost on reopen");
    assert_eq!(record.attempts, 1);
    assert_eq!(record.payload, json!({"to": "x"}));
    assert_eq!(db.store().count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimants_never_share_an_id() {
    let db = Arc::new(TestStore::new().await);
    for n in 0..20 {
        db.store().create(&Job::new("email", json!(n)), &immediate(3)).await.unwrap();
    }

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let db = Arc::clone(&db);
            tokio::spawn(async move {
                let mut mine = Vec::new();
                while let Some(record) = db.store().fetch_next(&none()).await.unwrap() {
                    mine.push(record.id);
                }
                mine
            })
        })
        .collect();

    let mut all = Vec::new();
    for result in futures::future::join_all(tasks).await {
        all.extend(result.unwrap());
    }

    let unique: HashSet<JobId> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simultaneous_fetches_get_different_records() {
    let db = TestStore::new().await;
    let store = db.store();

    store.create(&Job::new("email", json!(1)), &immediate(3)).await.unwrap();
    store.create(&Job::new("email", json!(2)), &immediate(3)).await.unwrap();

    let (skip_a, skip_b) = (none(), none());
    let (first, second) = tokio::join!(store.fetch_next(&skip_a), store.fetch_next(&skip_b));
    let first = first.unwrap().expect("first fetch found nothing");
    let second = second.unwrap().expect("second fetch found nothing");

    assert_ne!(first.id, second.id);
    assert!(store.fetch_next(&none()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_claimed_record_is_returned_again_once_let_go() {
    let db = TestStore::new().await;
    let store = db.store();

    let id = store.create(&Job::new("email", json!(null)), &immediate(0)).await.unwrap();

    assert_eq!(store.fetch_next(&none()).await.unwrap().unwrap().id, id);
    assert!(store.fetch_next(&none()).await.unwrap().is_none());

    // Peeking ignores the reservation.
    assert_eq!(store.fetch_next_for_tag("email", &none()).await.unwrap().unwrap().id, id);

    store.release(id).await;
    assert_eq!(store.fetch_next(&none()).await.unwrap().unwrap().id, id);

    store.reschedule(id).await.unwrap();
    assert_eq!(store.fetch_next(&none()).await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn test_health_check() {
    let db = TestStore::new().await;
    db.store().health_check().await.unwrap();
}
