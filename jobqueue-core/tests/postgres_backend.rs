//! Remote-entity (Postgres) backend integration tests, mirroring
//! `cyclotron-core/tests/base_ops.rs`'s use of `#[sqlx::test]`. These
//! require a live Postgres reachable via `DATABASE_URL` to actually run;
//! `sqlx::test` creates and tears down a scratch database per test.

use jobqueue_core::engine::{Engine, QueueEngine};
use jobqueue_core::storage::postgres::PostgresBackend;
use jobqueue_core::{EnqueueRequest, JobStatus, QueueError, TerminalStatus};
use sqlx::PgPool;

#[sqlx::test(migrations = "../migrations/postgres")]
async fn duplicate_enqueue_is_deduplicated(db: PgPool) {
    let engine = QueueEngine::new(Box::new(PostgresBackend::from_pool(db)));

    let req = EnqueueRequest {
        repository: "A".into(),
        commit: "X".into(),
        query: "Q".into(),
    };

    let first = engine.enqueue(req.clone()).await.unwrap();
    let second = engine.enqueue(req).await.unwrap();
    assert_eq!(first.id, second.id);
}

#[sqlx::test(migrations = "../migrations/postgres")]
async fn full_lifecycle_end_to_end(db: PgPool) {
    let engine = QueueEngine::new(Box::new(PostgresBackend::from_pool(db)));

    let enqueued = engine
        .enqueue(EnqueueRequest {
            repository: "A".into(),
            commit: "X".into(),
            query: "Q".into(),
        })
        .await
        .unwrap();

    let running = engine.dequeue("w1".into()).await.unwrap();
    assert_eq!(running.id, enqueued.id);
    assert_eq!(running.status, JobStatus::Running);

    engine
        .finish(running.id, TerminalStatus::Succeeded, "gs://b/o.pb".into())
        .await
        .unwrap();

    let fetched = engine.get(running.id).await.unwrap();
    assert_eq!(fetched.status, JobStatus::Succeeded);
    assert_eq!(fetched.result_url.as_deref(), Some("gs://b/o.pb"));
}

#[sqlx::test(migrations = "../migrations/postgres")]
async fn reenqueue_after_failure_gets_a_new_id(db: PgPool) {
    let engine = QueueEngine::new(Box::new(PostgresBackend::from_pool(db)));

    let req = EnqueueRequest {
        repository: "A".into(),
        commit: "X".into(),
        query: "Q".into(),
    };

    let first = engine.enqueue(req.clone()).await.unwrap();
    engine.dequeue("w1".into()).await.unwrap();
    engine
        .finish(first.id, TerminalStatus::Failed, "boom".into())
        .await
        .unwrap();

    let second = engine.enqueue(req).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[sqlx::test(migrations = "../migrations/postgres")]
async fn empty_queue_is_no_outstanding_jobs(db: PgPool) {
    let engine = QueueEngine::new(Box::new(PostgresBackend::from_pool(db)));
    let err = engine.dequeue("w1".into()).await.unwrap_err();
    assert!(matches!(err.kind(), QueueError::NoOutstandingJobs));
}

#[sqlx::test(migrations = "../migrations/postgres")]
async fn concurrent_producers_and_consumers_stress(db: PgPool) {
    use std::sync::Arc;

    const N: usize = 10;
    const M: usize = 20;

    let engine = Arc::new(QueueEngine::new(Box::new(PostgresBackend::from_pool(db))));

    let mut producers = Vec::new();
    for p in 0..N {
        let engine = engine.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..M {
                engine
                    .enqueue(EnqueueRequest {
                        repository: "A".into(),
                        commit: "X".into(),
                        query: format!("producer-{p}-job-{i}"),
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for p in producers {
        p.await.unwrap();
    }

    let mut consumers = Vec::new();
    for w in 0..N {
        let engine = engine.clone();
        consumers.push(tokio::spawn(async move {
            for _ in 0..M {
                engine.dequeue(format!("worker-{w}")).await.unwrap();
            }
        }));
    }
    for c in consumers {
        c.await.unwrap();
    }

    let err = engine.dequeue("late-worker".into()).await.unwrap_err();
    assert!(matches!(err.kind(), QueueError::NoOutstandingJobs));
}
