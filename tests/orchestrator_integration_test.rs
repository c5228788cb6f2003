//! End-to-end orchestrator tests over a real repository: the linear flow,
//! file-ownership serialization, and stuck-agent recovery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{seed_ticket, wait_for};
use foreman::cli::app::App;
use foreman::domain::models::{Project, Task, TaskStatus};

struct Fixture {
    app: Arc<App>,
    _repo_dir: tempfile::TempDir,
    _worktrees: tempfile::TempDir,
    project: Project,
}

async fn fixture() -> Fixture {
    let repo_dir = tempfile::tempdir().unwrap();
    common::init_git_repo(repo_dir.path());
    let worktrees = tempfile::tempdir().unwrap();
    let root = worktrees.path().to_path_buf();

    let app = common::test_app_with(|config| {
        config.sandbox.worktrees_root = root.display().to_string();
        config.orchestrator.workers = 2;
        config.orchestrator.poll_interval_ms = 25;
        config.orchestrator.shutdown_grace_secs = 0;
    })
    .await;

    let project = Project::new("e2e", repo_dir.path().display().to_string(), "phase-requirements")
        .with_autonomous_mode(true)
        .with_max_concurrent(4);
    app.projects.create(&project).await.unwrap();
    app.registry.install_defaults(project.id).await.unwrap();

    Fixture { app, _repo_dir: repo_dir, _worktrees: worktrees, project }
}

async fn wait_for_status(app: &Arc<App>, task_id: uuid::Uuid, status: TaskStatus) -> Task {
    let app = Arc::clone(app);
    wait_for(Duration::from_secs(10), &format!("task {task_id} to reach {}", status.as_str()), move || {
        let app = Arc::clone(&app);
        async move {
            let task = app.queue.get(task_id).await.unwrap().unwrap();
            (task.status == status).then_some(task)
        }
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn linear_flow_runs_task_and_hits_the_phase_gate() {
    let fixture = fixture().await;
    let app = &fixture.app;
    let ticket = seed_ticket(app, &fixture.project).await;
    let task = app
        .queue
        .enqueue(Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "do the work"))
        .await
        .unwrap();

    let handle = app.orchestrator.start().await.unwrap();

    // The worker claims, spawns a sandbox, and marks the task running.
    let running = wait_for_status(app, task.id, TaskStatus::Running).await;
    assert!(running.sandbox_id.is_some(), "running tasks always carry a sandbox");

    // The authoritative completion callback finishes the task.
    let unblocked = app
        .orchestrator
        .complete_callback(task.id, true, serde_json::json!({"done": true}), None)
        .await
        .unwrap();
    assert!(unblocked.is_empty());

    let completed = wait_for_status(app, task.id, TaskStatus::Completed).await;
    assert_eq!(completed.result, Some(serde_json::json!({"done": true})));

    // Completion tried to advance the phase; the unsatisfied requirements
    // gate rejected it and said so on the bus.
    let app_clone = Arc::clone(app);
    wait_for(Duration::from_secs(5), "phase.gate.rejected event", move || {
        let app = Arc::clone(&app_clone);
        async move {
            let events = app.event_store.tail(Some("events.phase.gate.rejected"), 5).await.unwrap();
            (!events.is_empty()).then_some(())
        }
    })
    .await;

    // Locks (none were declared) and the sandbox are gone.
    assert!(app.locks.list_active().await.unwrap().is_empty());

    app.orchestrator.shutdown(handle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_file_ownership_serializes_tasks() {
    let fixture = fixture().await;
    let app = &fixture.app;
    let ticket = seed_ticket(app, &fixture.project).await;

    let shared = vec!["svc/x.rs".to_string()];
    let a = app
        .queue
        .enqueue(
            Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "edit x first")
                .with_estimated_files(shared.clone()),
        )
        .await
        .unwrap();
    let b = app
        .queue
        .enqueue(
            Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "edit x second")
                .with_estimated_files(shared),
        )
        .await
        .unwrap();

    let handle = app.orchestrator.start().await.unwrap();

    // Exactly one of the two reaches running; the other defers on the lock.
    let first_running = {
        let app = Arc::clone(app);
        wait_for(Duration::from_secs(10), "one of the contenders to run", move || {
            let app = Arc::clone(&app);
            async move {
                for id in [a.id, b.id] {
                    let task = app.queue.get(id).await.unwrap().unwrap();
                    if task.status == TaskStatus::Running {
                        return Some(task);
                    }
                }
                None
            }
        })
        .await
    };
    let other_id = if first_running.id == a.id { b.id } else { a.id };

    // Give the workers a few cycles: the loser must never start running
    // while the winner holds the file.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let other = app.queue.get(other_id).await.unwrap().unwrap();
    assert_ne!(other.status, TaskStatus::Running, "both tasks ran on the same file");

    app.orchestrator
        .complete_callback(first_running.id, true, serde_json::json!({}), None)
        .await
        .unwrap();

    // The lock released; the deferred task now runs.
    wait_for_status(app, other_id, TaskStatus::Running).await;

    app.orchestrator
        .complete_callback(other_id, true, serde_json::json!({}), None)
        .await
        .unwrap();
    app.orchestrator.shutdown(handle).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_agent_is_cancelled_and_requeued_with_resumption() {
    let fixture = fixture().await;
    let app = &fixture.app;
    let ticket = seed_ticket(app, &fixture.project).await;
    let task = app
        .queue
        .enqueue(Task::new(ticket.id, fixture.project.id, ticket.current_phase.clone(), "long haul"))
        .await
        .unwrap();

    let handle = app.orchestrator.start().await.unwrap();
    let running = wait_for_status(app, task.id, TaskStatus::Running).await;
    let first_sandbox = running.sandbox_id.unwrap();

    // Leave a session transcript behind for the resumption path.
    let sandbox = app.spawner.list_active().await.unwrap().into_iter().find(|s| s.id == first_sandbox).unwrap();
    let transcripts = std::path::Path::new(&sandbox.workspace_path).join(".planning/session_transcripts");
    std::fs::write(transcripts.join("session.jsonl"), "{\"turn\":1}\n").unwrap();

    // The guardian declared the agent stuck; recovery cancels, checkpoints,
    // and requeues with the retry counter bumped.
    app.orchestrator.recover_stuck_task(task.id).await.unwrap();

    let requeued = app.queue.get(task.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.retry_count, 1);

    // The checkpoint is in the store, ready to hydrate the next sandbox.
    let resume = app.spawner.resume_handle_for(task.id, &task.phase_id, false).await.unwrap();
    assert!(resume.is_some());

    // A fresh sandbox picks the task up again.
    let rerunning = wait_for_status(app, task.id, TaskStatus::Running).await;
    assert_ne!(rerunning.sandbox_id.unwrap(), first_sandbox);

    app.orchestrator
        .complete_callback(task.id, true, serde_json::json!({}), None)
        .await
        .unwrap();
    app.orchestrator.shutdown(handle).await.unwrap();
}
