//! `DatabaseJobRegistry` over SQLite: persistence, compare-and-set fencing
//! and listing.

mod test_utils;

use std::time::Duration;

use chrono::Utc;
use reindex::copier::BatchResult;
use reindex::cursor::{Cursor, CursorTracker, SortValue};
use reindex::error::ReindexError;
use reindex::models::{FailureCause, FailureKind, JobStatus};
use reindex::registry::{DatabaseJobRegistry, JobRegistry, update_job};
use test_utils::{setup_test_db, spec};
use uuid::Uuid;

async fn registry() -> DatabaseJobRegistry {
    DatabaseJobRegistry::new(setup_test_db().await.expect("test database"))
}

fn cursor_after(id: i64) -> Cursor {
    CursorTracker::for_job(&spec(100, 3))
        .encode(&SortValue::Long(id))
        .unwrap()
}

#[tokio::test]
async fn created_job_round_trips_through_the_table() {
    let registry = registry().await;
    let job_id = registry.create(spec(250, 4)).await.unwrap();

    let state = registry.get(job_id).await.unwrap();

    assert_eq!(state.id, job_id);
    assert_eq!(state.status, JobStatus::Pending);
    assert_eq!(state.cursor, Cursor::start());
    assert_eq!(state.version, 0);
    assert_eq!(state.spec.batch_size, 250);
    assert_eq!(state.spec.retry.max_retries, 4);
    assert_eq!(state.spec.source.collection, "products_v1");
    assert!(state.execution_id.is_none());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let registry = registry().await;
    let missing = Uuid::new_v4();

    assert!(matches!(
        registry.get(missing).await,
        Err(ReindexError::JobNotFound(id)) if id == missing
    ));
}

#[tokio::test]
async fn cas_on_unknown_job_is_not_found() {
    let registry = registry().await;
    let job_id = registry.create(spec(100, 3)).await.unwrap();
    let state = registry.get(job_id).await.unwrap();
    let missing = Uuid::new_v4();

    let result = registry
        .compare_and_set(missing, &state, state.clone())
        .await;

    assert!(matches!(result, Err(ReindexError::JobNotFound(id)) if id == missing));
}

#[tokio::test]
async fn cas_persists_progress_and_bumps_version() {
    let registry = registry().await;
    let job_id = registry.create(spec(100, 3)).await.unwrap();
    let execution_id = Uuid::new_v4();

    let pending = registry.get(job_id).await.unwrap();
    let running = pending.start(execution_id, Utc::now()).unwrap();
    assert!(registry.compare_and_set(job_id, &pending, running.clone()).await.unwrap());

    let batch = BatchResult {
        docs_read: 100,
        docs_written: 100,
        cursor: cursor_after(100),
        exhausted: false,
    };
    let advanced = running.record_batch(&batch, Utc::now()).unwrap();
    assert!(registry.compare_and_set(job_id, &running, advanced).await.unwrap());

    let stored = registry.get(job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.version, 2);
    assert_eq!(stored.docs_copied, 100);
    assert_eq!(stored.batches_completed, 1);
    assert_eq!(stored.cursor, cursor_after(100));
    assert_eq!(stored.execution_id, Some(execution_id));
    assert!(stored.started_at.is_some());
}

#[tokio::test]
async fn stale_writer_loses_and_store_is_untouched() {
    let registry = registry().await;
    let job_id = registry.create(spec(100, 3)).await.unwrap();

    let snapshot = registry.get(job_id).await.unwrap();
    let first = snapshot.start(Uuid::new_v4(), Utc::now()).unwrap();
    let second = snapshot.start(Uuid::new_v4(), Utc::now()).unwrap();

    assert!(registry.compare_and_set(job_id, &snapshot, first.clone()).await.unwrap());
    assert!(!registry.compare_and_set(job_id, &snapshot, second).await.unwrap());

    let stored = registry.get(job_id).await.unwrap();
    assert_eq!(stored.execution_id, first.execution_id);
    assert_eq!(stored.version, 1);
}

#[tokio::test]
async fn failure_cause_is_persisted() {
    let registry = registry().await;
    let job_id = registry.create(spec(100, 3)).await.unwrap();

    update_job(&registry, job_id, |s| {
        s.fail(
            FailureCause::new(FailureKind::FatalCopy, "fatal copy failure: HTTP 400"),
            Utc::now(),
        )
    })
    .await
    .unwrap();

    let stored = registry.get(job_id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let cause = stored.last_error.unwrap();
    assert_eq!(cause.kind, FailureKind::FatalCopy);
    assert_eq!(cause.message, "fatal copy failure: HTTP 400");
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
async fn resume_of_failed_job_carries_cursor() {
    let registry = registry().await;
    let job_id = registry.create(spec(100, 3)).await.unwrap();
    let execution_id = Uuid::new_v4();

    update_job(&registry, job_id, |s| s.start(execution_id, Utc::now()))
        .await
        .unwrap();
    let batch = BatchResult {
        docs_read: 100,
        docs_written: 100,
        cursor: cursor_after(100),
        exhausted: false,
    };
    update_job(&registry, job_id, |s| s.record_batch(&batch, Utc::now()))
        .await
        .unwrap();

    // Only failed jobs can seed a resume.
    assert!(matches!(
        registry.create_resume(job_id).await,
        Err(ReindexError::IllegalTransition { .. })
    ));

    update_job(&registry, job_id, |s| {
        s.fail(FailureCause::new(FailureKind::LostWorker, "gone"), Utc::now())
    })
    .await
    .unwrap();

    let resumed_id = registry.create_resume(job_id).await.unwrap();
    let resumed = registry.get(resumed_id).await.unwrap();

    assert_ne!(resumed_id, job_id);
    assert_eq!(resumed.status, JobStatus::Pending);
    assert_eq!(resumed.resumed_from, Some(job_id));
    assert_eq!(resumed.cursor, cursor_after(100));
    assert_eq!(resumed.docs_copied, 100);
    assert!(resumed.last_error.is_none());
}

#[tokio::test]
async fn pause_request_is_stored() {
    let registry = registry().await;
    let job_id = registry.create(spec(100, 3)).await.unwrap();

    let paused = registry.request_pause(job_id).await.unwrap();

    assert!(paused.pause_requested);
    assert!(registry.get(job_id).await.unwrap().pause_requested);
}

#[tokio::test]
async fn list_is_newest_first_and_filters_by_status() {
    let registry = registry().await;
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(registry.create(spec(100, 3)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    update_job(&registry, ids[1], |s| s.start(Uuid::new_v4(), Utc::now()))
        .await
        .unwrap();

    let all = registry.list(None, 10).await.unwrap();
    let order: Vec<Uuid> = all.iter().map(|j| j.id).collect();
    assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

    let pending = registry.list(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|j| j.status == JobStatus::Pending));

    let limited = registry.list(None, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, ids[2]);
}

#[tokio::test]
async fn list_assigned_returns_every_claimed_job_oldest_heartbeat_first() {
    let registry = registry().await;
    let mut assigned = Vec::new();
    for _ in 0..3 {
        let job_id = registry.create(spec(100, 3)).await.unwrap();
        update_job(&registry, job_id, |s| s.assign(Uuid::new_v4(), Utc::now()))
            .await
            .unwrap();
        assigned.push(job_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    registry.create(spec(100, 3)).await.unwrap();
    let done = registry.create(spec(100, 3)).await.unwrap();
    update_job(&registry, done, |s| s.start(Uuid::new_v4(), Utc::now()))
        .await
        .unwrap();
    update_job(&registry, done, |s| s.complete(Utc::now()))
        .await
        .unwrap();

    // The first job heartbeats last.
    update_job(&registry, assigned[0], |s| s.heartbeat(Utc::now()))
        .await
        .unwrap();

    let ids: Vec<Uuid> = registry
        .list_assigned()
        .await
        .unwrap()
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(ids, vec![assigned[1], assigned[2], assigned[0]]);
}
