//! Task queue integration tests: eligibility, gating, atomic claims, and
//! status transitions.

mod common;

use std::collections::HashSet;
use uuid::Uuid;

use common::{seed_project, seed_task, seed_task_with, seed_ticket, test_app};
use foreman::domain::models::{Priority, Task, TaskStatus, TicketStatus};
use foreman::domain::ports::ClaimFilter;

#[tokio::test]
async fn zero_dependency_task_is_eligible_immediately() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let task = seed_task(&app, &ticket, "standalone").await;

    let ready = app.queue.get_ready_batch(None, 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, task.id);

    let claimed = app.queue.claim_next("agent-1", &ClaimFilter::default()).await.unwrap();
    assert_eq!(claimed.unwrap().id, task.id);
}

#[tokio::test]
async fn dependencies_gate_eligibility_until_completion() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let a = seed_task(&app, &ticket, "first").await;
    let b = seed_task_with(&app, &ticket, "second", Priority::Medium, vec![a.id], vec![]).await;

    // Only A is claimable while B's dependency is open.
    let claimed = app.queue.claim_next("agent-1", &ClaimFilter::default()).await.unwrap().unwrap();
    assert_eq!(claimed.id, a.id);
    assert!(app.queue.claim_next("agent-1", &ClaimFilter::default()).await.unwrap().is_none());

    let sandbox_id = Uuid::new_v4();
    app.queue.mark_running(a.id, sandbox_id).await.unwrap();
    assert!(app.queue.complete(a.id, serde_json::json!({"ok": true})).await.unwrap());

    let unblocked = app.queue.recompute_unblocked(a.id).await.unwrap();
    assert_eq!(unblocked.len(), 1);
    assert_eq!(unblocked[0].id, b.id);

    let claimed = app.queue.claim_next("agent-1", &ClaimFilter::default()).await.unwrap().unwrap();
    assert_eq!(claimed.id, b.id);
}

#[tokio::test]
async fn priority_then_fifo_ordering() {
    let app = test_app().await;
    let project = seed_project(&app, true, 10).await;
    let ticket = seed_ticket(&app, &project).await;

    let medium = seed_task_with(&app, &ticket, "medium", Priority::Medium, vec![], vec![]).await;
    let critical = seed_task_with(&app, &ticket, "critical", Priority::Critical, vec![], vec![]).await;
    let high = seed_task_with(&app, &ticket, "high", Priority::High, vec![], vec![]).await;

    let filter = ClaimFilter::default();
    let first = app.queue.claim_next("agent", &filter).await.unwrap().unwrap();
    let second = app.queue.claim_next("agent", &filter).await.unwrap().unwrap();
    let third = app.queue.claim_next("agent", &filter).await.unwrap().unwrap();

    assert_eq!(first.id, critical.id);
    assert_eq!(second.id, high.id);
    assert_eq!(third.id, medium.id);
}

#[tokio::test]
async fn autonomous_gate_and_manual_release() {
    let app = test_app().await;
    let project = seed_project(&app, false, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let task = seed_task(&app, &ticket, "held back").await;

    // Autonomous mode off: nothing is claimable.
    assert!(app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().is_none());

    // An explicit user release makes exactly that task claimable.
    app.tasks.set_manual_release(task.id, true).await.unwrap();
    let claimed = app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    assert_eq!(claimed.unwrap().id, task.id);
}

#[tokio::test]
async fn autonomous_toggle_respects_concurrency_ceiling() {
    let app = test_app().await;
    let project = seed_project(&app, false, 2).await;
    let ticket = seed_ticket(&app, &project).await;
    for i in 0..3 {
        seed_task(&app, &ticket, &format!("task {i}")).await;
    }

    // Off: the orchestrator claims zero of the three eligible tasks.
    assert!(app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().is_none());

    // On: claims succeed up to the ceiling of two.
    app.projects.set_autonomous_mode(project.id, true).await.unwrap();
    let first = app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    let second = app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    let third = app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    assert!(first.is_some());
    assert!(second.is_some());
    assert!(third.is_none(), "ceiling of 2 must hold");

    // Completing one in-flight task frees a slot for the third.
    let done = first.unwrap();
    app.queue.mark_running(done.id, Uuid::new_v4()).await.unwrap();
    app.queue.complete(done.id, serde_json::json!({})).await.unwrap();
    assert!(app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_claims_never_double_assign() {
    let app = test_app().await;
    let project = seed_project(&app, true, 10).await;
    let ticket = seed_ticket(&app, &project).await;
    for i in 0..3 {
        seed_task(&app, &ticket, &format!("task {i}")).await;
    }

    let mut claims = Vec::new();
    for i in 0..10 {
        let app = std::sync::Arc::clone(&app);
        claims.push(tokio::spawn(async move {
            app.queue
                .claim_next(&format!("agent-{i}"), &ClaimFilter::default())
                .await
                .unwrap()
        }));
    }

    let mut claimed_ids = HashSet::new();
    let mut successes = 0;
    for claim in claims {
        if let Some(task) = claim.await.unwrap() {
            successes += 1;
            assert!(claimed_ids.insert(task.id), "task claimed twice: {}", task.id);
        }
    }
    assert_eq!(successes, 3, "exactly min(eligible, callers) claims succeed");
}

#[tokio::test]
async fn completion_is_idempotent() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let task = seed_task(&app, &ticket, "once").await;

    app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().unwrap();
    app.queue.mark_running(task.id, Uuid::new_v4()).await.unwrap();

    assert!(app.queue.complete(task.id, serde_json::json!({"n": 1})).await.unwrap());
    assert!(!app.queue.complete(task.id, serde_json::json!({"n": 2})).await.unwrap());

    let stored = app.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.result, Some(serde_json::json!({"n": 1})));
}

#[tokio::test]
async fn defer_returns_claim_without_burning_retry() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let task = seed_task(&app, &ticket, "deferrable").await;

    app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().unwrap();
    assert!(app.queue.defer(task.id).await.unwrap());

    let stored = app.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.agent_id.is_none());
}

#[tokio::test]
async fn failed_task_requeues_with_retry_count() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let task = seed_task(&app, &ticket, "flaky").await;

    app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().unwrap();
    app.queue.mark_running(task.id, Uuid::new_v4()).await.unwrap();
    assert!(app.queue.fail(task.id, "boom").await.unwrap());

    assert!(app.queue.requeue_for_retry(task.id).await.unwrap());
    let stored = app.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.sandbox_id.is_none());

    // Exhaustion: once retry_count reaches max_retries the requeue refuses
    // and the task stays failed.
    for _ in 0..stored.max_retries {
        app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().unwrap();
        app.queue.mark_running(task.id, Uuid::new_v4()).await.unwrap();
        app.queue.fail(task.id, "boom").await.unwrap();
        app.queue.requeue_for_retry(task.id).await.unwrap();
    }
    let stored = app.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(stored.retry_count, stored.max_retries);
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(!app.queue.requeue_for_retry(task.id).await.unwrap());
}

#[tokio::test]
async fn blocked_ticket_withholds_its_tasks() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let mut ticket = seed_ticket(&app, &project).await;
    seed_task(&app, &ticket, "held by ticket").await;

    ticket.status = TicketStatus::Blocked;
    ticket.touch();
    app.tickets.update(&ticket).await.unwrap();

    assert!(app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().is_none());
}

#[tokio::test]
async fn enqueue_rejects_unknown_and_cross_project_dependencies() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;

    let ghost = Uuid::new_v4();
    let task = Task::new(ticket.id, ticket.project_id, ticket.current_phase.clone(), "depends on ghost")
        .with_dependency(ghost);
    assert!(app.queue.enqueue(task).await.is_err());

    let other_project = seed_project(&app, true, 4).await;
    let other_ticket = seed_ticket(&app, &other_project).await;
    let foreign = seed_task(&app, &other_ticket, "foreign").await;

    let task = Task::new(ticket.id, ticket.project_id, ticket.current_phase.clone(), "cross project")
        .with_dependency(foreign.id);
    assert!(app.queue.enqueue(task).await.is_err());
}
