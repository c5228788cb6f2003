//! Coordination and synthesis integration tests: joins, sync points, and
//! result merging into continuation context (scenario: parallel fan-in).

mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use common::{seed_project, seed_task, seed_task_with, seed_ticket, test_app};
use foreman::domain::models::{JoinStatus, MergeStrategy, Priority, SyncPointStatus};
use foreman::domain::ports::ClaimFilter;

#[tokio::test]
async fn register_join_enforces_source_subset_invariant() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "a").await;
    let b = seed_task(&app, &ticket, "b").await;
    let c = seed_task_with(&app, &ticket, "c", Priority::Medium, vec![a.id, b.id], vec![]).await;

    // Sources must be dependencies of the continuation.
    let stranger = seed_task(&app, &ticket, "stranger").await;
    let invalid = app
        .coordination
        .register_join(vec![a.id, stranger.id], c.id, MergeStrategy::Combine, None, None)
        .await;
    assert!(invalid.is_err());

    let join = app
        .coordination
        .register_join(vec![a.id, b.id], c.id, MergeStrategy::Combine, None, None)
        .await
        .unwrap();
    assert_eq!(join.status, JoinStatus::Waiting);
    assert_eq!(join.threshold(), 2);
}

#[tokio::test]
async fn split_fans_parent_out_into_dependent_children() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let parent = seed_task(&app, &ticket, "decompose feature").await;

    let children = vec![
        foreman::domain::models::Task::new(ticket.id, project.id, ticket.current_phase.clone(), "part one"),
        foreman::domain::models::Task::new(ticket.id, project.id, ticket.current_phase.clone(), "part two"),
    ];
    let spawned = app.coordination.split(&parent, children).await.unwrap();

    assert_eq!(spawned.len(), 2);
    for child in &spawned {
        assert_eq!(child.depends_on, vec![parent.id]);
    }

    // Children stay ineligible until the parent completes.
    let ready = app.queue.get_ready_batch(None, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, parent.id);
}

#[tokio::test]
async fn ensure_join_auto_registers_for_multi_dependency_tasks() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "a").await;
    let b = seed_task(&app, &ticket, "b").await;
    let c = seed_task_with(&app, &ticket, "c", Priority::Medium, vec![a.id, b.id], vec![]).await;

    // Single-dependency tasks get no join.
    let single = seed_task_with(&app, &ticket, "single", Priority::Medium, vec![a.id], vec![]).await;
    assert!(app.coordination.ensure_join(&single).await.unwrap().is_none());

    let first = app.coordination.ensure_join(&c).await.unwrap().unwrap();
    assert_eq!(first.strategy, MergeStrategy::Combine);

    // Idempotent: the second call finds the existing registration.
    let second = app.coordination.ensure_join(&c).await.unwrap().unwrap();
    assert_eq!(first.id, second.id);
}

#[tokio::test]
async fn completed_sources_synthesize_into_continuation_context() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "a").await;
    let b = seed_task(&app, &ticket, "b").await;
    let c = seed_task_with(&app, &ticket, "c", Priority::Medium, vec![a.id, b.id], vec![]).await;
    app.coordination
        .register_join(vec![a.id, b.id], c.id, MergeStrategy::Combine, None, None)
        .await
        .unwrap();

    // Complete A; the join waits.
    app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    app.queue.mark_running(a.id, Uuid::new_v4()).await.unwrap();
    app.queue.complete(a.id, json!({"from_a": 1})).await.unwrap();
    let fired = app.synthesis.on_source_completed(a.id).await.unwrap();
    assert!(fired.is_empty());

    // Complete B; the join fires and the merged payload lands on C.
    app.queue.mark_running(b.id, Uuid::new_v4()).await.unwrap();
    app.queue.complete(b.id, json!({"from_b": 2})).await.unwrap();
    let fired = app.synthesis.on_source_completed(b.id).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].status, JoinStatus::Ready);

    let continuation = app.queue.get(c.id).await.unwrap().unwrap();
    assert_eq!(continuation.synthesis_context, Some(json!({"from_a": 1, "from_b": 2})));

    // Replaying the completion is a no-op (idempotent on arrival).
    let fired = app.synthesis.on_source_completed(b.id).await.unwrap();
    assert!(fired.is_empty());
}

#[tokio::test]
async fn required_count_fires_join_early() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "a").await;
    let b = seed_task(&app, &ticket, "b").await;
    let c = seed_task(&app, &ticket, "c").await;
    let cont = seed_task_with(&app, &ticket, "cont", Priority::Medium, vec![a.id, b.id, c.id], vec![]).await;

    let join = app
        .coordination
        .register_join(vec![a.id, b.id, c.id], cont.id, MergeStrategy::Union, Some(2), None)
        .await
        .unwrap();

    // Two of three sources complete: the join fires without the third.
    for task in [&a, &b] {
        app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
        app.queue.mark_running(task.id, Uuid::new_v4()).await.unwrap();
        app.queue.complete(task.id, json!([task.id.to_string()])).await.unwrap();
        app.synthesis.on_source_completed(task.id).await.unwrap();
    }

    let registration = app.coordination.get_join(join.id).await.unwrap().unwrap();
    assert_eq!(registration.status, JoinStatus::Ready);

    let continuation = app.queue.get(cont.id).await.unwrap().unwrap();
    let context = continuation.synthesis_context.unwrap();
    let merged = context.as_array().unwrap();
    assert_eq!(merged.len(), 2, "union of the two arrived results");
}

#[tokio::test]
async fn join_deadline_failure_is_published() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "a").await;
    let b = seed_task(&app, &ticket, "b").await;
    let c = seed_task_with(&app, &ticket, "c", Priority::Medium, vec![a.id, b.id], vec![]).await;

    app.coordination
        .register_join(
            vec![a.id, b.id],
            c.id,
            MergeStrategy::Combine,
            None,
            Some(Utc::now() - Duration::seconds(1)),
        )
        .await
        .unwrap();

    let failed = app.synthesis.sweep_deadlines().await.unwrap();
    assert_eq!(failed, 1);

    let registration = app.coordination.ensure_join(&c).await.unwrap().unwrap();
    assert_eq!(registration.status, JoinStatus::Failed);
}

#[tokio::test]
async fn sync_point_reaches_ready_at_required_count() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "a").await;
    let b = seed_task(&app, &ticket, "b").await;
    let c = seed_task(&app, &ticket, "c").await;

    let point = app
        .coordination
        .sync_point("integration-gate", vec![a.id, b.id, c.id], 2, None)
        .await
        .unwrap();
    assert_eq!(point.status, SyncPointStatus::Waiting);

    for task in [&a, &b] {
        app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
        app.queue.mark_running(task.id, Uuid::new_v4()).await.unwrap();
        app.queue.complete(task.id, json!({})).await.unwrap();
        app.synthesis.on_source_completed(task.id).await.unwrap();
    }

    // Two of three arrived; the gate is ready.
    let stored = app.coordination.get_sync_point("integration-gate").await.unwrap().unwrap();
    assert_eq!(stored.status, SyncPointStatus::Ready);
    assert_eq!(stored.arrived.len(), 2);

    // Names are unique.
    let duplicate = app.coordination.sync_point("integration-gate", vec![c.id], 1, None).await;
    assert!(duplicate.is_err());
}
