//! Convergence merge tests over a real repository: parallel task branches
//! reconciled into the ticket branch, and conflict escalation.

mod common;

use std::collections::HashMap;

use common::{seed_ticket, test_app_with};
use foreman::domain::models::{
    JoinStatus, MergeAttemptOutcome, MergeStrategy, Project, Task, TaskStatus, TicketStatus,
};
use foreman::domain::ports::ClaimFilter;

struct Fixture {
    app: std::sync::Arc<foreman::cli::app::App>,
    _repo_dir: tempfile::TempDir,
    worktrees: tempfile::TempDir,
    project: Project,
}

async fn fixture() -> Fixture {
    let repo_dir = tempfile::tempdir().unwrap();
    common::init_git_repo(repo_dir.path());
    let worktrees = tempfile::tempdir().unwrap();
    let root = worktrees.path().to_path_buf();

    let app = test_app_with(|config| {
        config.sandbox.worktrees_root = root.display().to_string();
    })
    .await;

    let project = Project::new("merge-fixture", repo_dir.path().display().to_string(), "phase-requirements");
    app.projects.create(&project).await.unwrap();
    app.registry.install_defaults(project.id).await.unwrap();

    Fixture { app, _repo_dir: repo_dir, worktrees, project }
}

/// Spawn a sandbox for the task, write a file in its worktree, commit, and
/// complete the task.
async fn execute_task(fixture: &Fixture, ticket: &foreman::domain::models::Ticket, task: &Task, file: &str, content: &str) {
    let app = &fixture.app;
    let sandbox = app
        .spawner
        .spawn_for_task(task, ticket, &fixture.project, "main", HashMap::new(), None)
        .await
        .unwrap();

    let workspace = fixture.worktrees.path().join(format!("task-{}", task.id));
    let full = workspace.join(file);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
    common::run(&workspace, &["add", "."]);
    common::run(&workspace, &["commit", "-m", &format!("work on {file}")]);

    app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap();
    app.queue.mark_running(task.id, sandbox.id).await.unwrap();
    app.queue.complete(task.id, serde_json::json!({"file": file})).await.unwrap();
}

#[tokio::test]
async fn parallel_branches_merge_into_continuation_workspace() {
    let fixture = fixture().await;
    let app = &fixture.app;
    let ticket = seed_ticket(app, &fixture.project).await;

    let a = app
        .queue
        .enqueue(Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "write a"))
        .await
        .unwrap();
    let b = app
        .queue
        .enqueue(Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "write b"))
        .await
        .unwrap();
    let c = app
        .queue
        .enqueue(
            Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "synthesize")
                .with_dependency(a.id)
                .with_dependency(b.id),
        )
        .await
        .unwrap();
    let join = app
        .coordination
        .register_join(vec![a.id, b.id], c.id, MergeStrategy::Combine, None, None)
        .await
        .unwrap();

    execute_task(&fixture, &ticket, &a, "module_a.rs", "pub fn a() {}\n").await;
    execute_task(&fixture, &ticket, &b, "module_b.rs", "pub fn b() {}\n").await;

    app.merger.prepare_workspace(c.id).await.unwrap();

    // Both source branches landed in the ticket workspace.
    let ticket_workspace = fixture.worktrees.path().join(format!("ticket-{}", ticket.id));
    assert!(ticket_workspace.join("module_a.rs").is_file());
    assert!(ticket_workspace.join("module_b.rs").is_file());

    let stored = app.coordination.get_join(join.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JoinStatus::Merged);

    let log = app.coordination.list_merge_attempts(join.id).await.unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|a| a.outcome == MergeAttemptOutcome::Clean));

    // The continuation workspace is tagged ready.
    let continuation = app.queue.get(c.id).await.unwrap().unwrap();
    let context = continuation.synthesis_context.unwrap();
    assert_eq!(context["workspace_ready"], serde_json::json!(true));
}

#[tokio::test]
async fn irresolvable_conflict_blocks_ticket_and_logs_attempts() {
    let fixture = fixture().await;
    let app = &fixture.app;
    let ticket = seed_ticket(app, &fixture.project).await;

    let a = app
        .queue
        .enqueue(Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "edit shared"))
        .await
        .unwrap();
    let b = app
        .queue
        .enqueue(Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "edit shared too"))
        .await
        .unwrap();
    let c = app
        .queue
        .enqueue(
            Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "synthesize")
                .with_dependency(a.id)
                .with_dependency(b.id),
        )
        .await
        .unwrap();
    let join = app
        .coordination
        .register_join(vec![a.id, b.id], c.id, MergeStrategy::Combine, None, None)
        .await
        .unwrap();

    // Same file, different content on both branches: a guaranteed conflict
    // that the noop resolver cannot fix.
    execute_task(&fixture, &ticket, &a, "shared.rs", "version A\n").await;
    execute_task(&fixture, &ticket, &b, "shared.rs", "version B\n").await;

    app.merger.prepare_workspace(c.id).await.unwrap();

    let stored_join = app.coordination.get_join(join.id).await.unwrap().unwrap();
    assert_eq!(stored_join.status, JoinStatus::Failed);

    let continuation = app.queue.get(c.id).await.unwrap().unwrap();
    assert_eq!(continuation.status, TaskStatus::Pending, "never started, stays pending");
    assert_eq!(continuation.last_error.as_deref(), Some("merge-conflict"));

    let stored_ticket = app.tickets.get(ticket.id).await.unwrap().unwrap();
    assert_eq!(stored_ticket.status, TicketStatus::Blocked);

    // Every resolution attempt is in the durable log.
    let log = app.coordination.list_merge_attempts(join.id).await.unwrap();
    assert!(!log.is_empty());
    assert!(log.iter().any(|a| a.outcome == MergeAttemptOutcome::Conflict));
    assert!(log.iter().all(|a| a.join_id == join.id));
}
