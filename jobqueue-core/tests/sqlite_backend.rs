//! Storage-adapter-level tests for the embedded-relational backend,
//! exercising the capability set from SPEC_FULL.md §4.1 directly rather
//! than through the engine, using a `tempfile`-backed database per
//! SPEC_FULL.md's TEST TOOLING section.

use jobqueue_core::storage::sqlite::SqliteBackend;
use jobqueue_core::storage::StorageBackend;
use jobqueue_core::types::{JobRecord, JobStatus, Triple};
use jobqueue_core::QueueError;

async fn backend() -> (tempfile::TempDir, SqliteBackend) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobqueue.sqlite3");
    let backend = SqliteBackend::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    backend.run_migrations().await.unwrap();
    (dir, backend)
}

#[tokio::test]
async fn insert_then_find_by_id_round_trips() {
    let (_dir, backend) = backend().await;

    let triple = Triple {
        repository: "A".into(),
        commit: "X".into(),
        query: "Q".into(),
    };
    let record = JobRecord::new_pending(triple, chrono::Utc::now());
    let record_id = record.id;

    backend
        .run_in_transaction_unit(Box::new(move |tx| {
            let record = record.clone();
            Box::pin(async move { tx.insert(&record).await })
        }))
        .await
        .unwrap();

    let fetched = backend.get_by_id(record_id).await.unwrap().unwrap();
    assert_eq!(fetched.id, record_id);
    assert_eq!(fetched.status, JobStatus::Pending);
}

#[tokio::test]
async fn find_by_triple_nonfailed_ignores_failed_records() {
    let (_dir, backend) = backend().await;

    let triple = Triple {
        repository: "A".into(),
        commit: "X".into(),
        query: "Q".into(),
    };

    let mut record = JobRecord::new_pending(triple.clone(), chrono::Utc::now());
    record.status = JobStatus::Failed;
    record.worker = Some("w1".into());
    record.start_time = Some(chrono::Utc::now());
    record.finish_time = Some(chrono::Utc::now());
    record.result_error = Some("boom".into());

    backend
        .run_in_transaction_unit(Box::new(move |tx| {
            let record = record.clone();
            Box::pin(async move { tx.insert(&record).await })
        }))
        .await
        .unwrap();

    let found = backend
        .run_in_transaction(Box::new(move |tx| {
            let triple = triple.clone();
            Box::pin(async move { tx.find_by_triple_nonfailed(&triple).await?.ok_or(QueueError::NotFound(uuid::Uuid::nil())) })
        }))
        .await;

    assert!(found.is_err(), "a FAILED record must not satisfy the dedup lookup");
}

#[tokio::test]
async fn update_on_unknown_id_is_not_found() {
    let (_dir, backend) = backend().await;

    let triple = Triple {
        repository: "A".into(),
        commit: "X".into(),
        query: "Q".into(),
    };
    let record = JobRecord::new_pending(triple, chrono::Utc::now());

    let result = backend
        .run_in_transaction_unit(Box::new(move |tx| {
            let record = record.clone();
            Box::pin(async move { tx.update(&record).await })
        }))
        .await;

    assert!(matches!(result, Err(QueueError::NotFound(_))));
}

#[tokio::test]
async fn find_oldest_pending_respects_fifo_order() {
    let (_dir, backend) = backend().await;

    let now = chrono::Utc::now();
    let older = JobRecord::new_pending(
        Triple {
            repository: "A".into(),
            commit: "X".into(),
            query: "older".into(),
        },
        now - chrono::Duration::seconds(5),
    );
    let newer = JobRecord::new_pending(
        Triple {
            repository: "A".into(),
            commit: "X".into(),
            query: "newer".into(),
        },
        now,
    );
    let older_id = older.id;

    for record in [newer, older] {
        backend
            .run_in_transaction_unit(Box::new(move |tx| {
                let record = record.clone();
                Box::pin(async move { tx.insert(&record).await })
            }))
            .await
            .unwrap();
    }

    let oldest = backend
        .run_in_transaction(Box::new(|tx| {
            Box::pin(async move {
                tx.find_oldest_pending()
                    .await?
                    .ok_or(QueueError::NoOutstandingJobs)
            })
        }))
        .await
        .unwrap();

    assert_eq!(oldest.id, older_id);
}
