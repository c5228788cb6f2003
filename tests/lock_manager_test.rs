//! Resource lock integration tests: exclusion semantics, idempotent
//! release, and expiry sweeping.

mod common;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::test_app;
use foreman::domain::models::{LockMode, ResourceType};
use foreman::DomainError;

#[tokio::test]
async fn exclusive_locks_never_overlap() {
    let app = test_app().await;
    let task_a = Uuid::new_v4();
    let task_b = Uuid::new_v4();

    app.locks
        .acquire(ResourceType::File, "svc/x.rs", task_a, "agent-a", LockMode::Exclusive, None)
        .await
        .unwrap();

    let second = app
        .locks
        .acquire(ResourceType::File, "svc/x.rs", task_b, "agent-b", LockMode::Exclusive, None)
        .await;
    assert!(matches!(second, Err(DomainError::Contention { .. })));

    // A different resource is unaffected.
    app.locks
        .acquire(ResourceType::File, "svc/y.rs", task_b, "agent-b", LockMode::Exclusive, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn shared_locks_coexist_but_block_exclusive() {
    let app = test_app().await;

    app.locks
        .acquire(ResourceType::Named, "schema", Uuid::new_v4(), "a", LockMode::Shared, None)
        .await
        .unwrap();
    app.locks
        .acquire(ResourceType::Named, "schema", Uuid::new_v4(), "b", LockMode::Shared, None)
        .await
        .unwrap();

    let exclusive = app
        .locks
        .acquire(ResourceType::Named, "schema", Uuid::new_v4(), "c", LockMode::Exclusive, None)
        .await;
    assert!(matches!(exclusive, Err(DomainError::Contention { .. })));
}

#[tokio::test]
async fn release_is_idempotent_and_frees_the_resource() {
    let app = test_app().await;
    let task = Uuid::new_v4();

    let lock = app
        .locks
        .acquire(ResourceType::File, "svc/x.rs", task, "agent", LockMode::Exclusive, None)
        .await
        .unwrap();

    app.locks.release(lock.id).await.unwrap();
    app.locks.release(lock.id).await.unwrap(); // Second release: no-op.

    app.locks
        .acquire(ResourceType::File, "svc/x.rs", Uuid::new_v4(), "other", LockMode::Exclusive, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn release_by_task_frees_everything_at_once() {
    let app = test_app().await;
    let task = Uuid::new_v4();

    for path in ["a.rs", "b.rs", "c.rs"] {
        app.locks
            .acquire(ResourceType::File, path, task, "agent", LockMode::Exclusive, None)
            .await
            .unwrap();
    }

    assert_eq!(app.locks.release_by_task(task).await.unwrap(), 3);
    assert_eq!(app.locks.release_by_task(task).await.unwrap(), 0); // Idempotent.
    assert!(app.locks.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_locks_are_swept_and_conflict_checks_ignore_them() {
    let app = test_app().await;
    let task = Uuid::new_v4();

    app.locks
        .acquire(
            ResourceType::File,
            "stale.rs",
            task,
            "agent",
            LockMode::Exclusive,
            Some(Duration::milliseconds(-1)), // Already expired.
        )
        .await
        .unwrap();

    // The expired lease does not block a fresh acquisition.
    app.locks
        .acquire(ResourceType::File, "stale.rs", Uuid::new_v4(), "other", LockMode::Exclusive, None)
        .await
        .unwrap();

    let swept = app.locks.sweep_expired(Utc::now()).await.unwrap();
    assert_eq!(swept, 1);
    assert_eq!(app.locks.sweep_expired(Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn file_conflict_probe_matches_exclusive_leases() {
    let app = test_app().await;
    let holder = Uuid::new_v4();
    let paths = vec!["src/engine.rs".to_string(), "src/queue.rs".to_string()];

    assert!(!app.locks.any_file_conflict(&paths, None).await.unwrap());

    app.locks
        .acquire(ResourceType::File, "src/queue.rs", holder, "agent", LockMode::Exclusive, None)
        .await
        .unwrap();

    assert!(app.locks.any_file_conflict(&paths, None).await.unwrap());
    // The holder itself is excluded from its own conflict check.
    assert!(!app.locks.any_file_conflict(&paths, Some(holder)).await.unwrap());
}

#[tokio::test]
async fn acquire_files_rolls_back_on_partial_contention() {
    let app = test_app().await;
    let holder = Uuid::new_v4();
    let contender = Uuid::new_v4();

    app.locks
        .acquire(ResourceType::File, "b.rs", holder, "holder", LockMode::Exclusive, None)
        .await
        .unwrap();

    let paths = vec!["a.rs".to_string(), "b.rs".to_string()];
    let outcome = app.locks.acquire_files(&paths, contender, "contender", None).await;
    assert!(matches!(outcome, Err(DomainError::Contention { .. })));

    // The partial lease on a.rs was rolled back.
    app.locks
        .acquire(ResourceType::File, "a.rs", Uuid::new_v4(), "third", LockMode::Exclusive, None)
        .await
        .unwrap();
}
