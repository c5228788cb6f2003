//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use foreman::adapters::sqlite::create_migrated_test_pool;
use foreman::cli::app::App;
use foreman::domain::models::{Priority, Project, Task, Ticket};
use foreman::infrastructure::Config;

/// Build the full service graph over a fresh in-memory database.
pub async fn test_app() -> Arc<App> {
    test_app_with(|_| {}).await
}

/// Like [`test_app`], with a config hook (e.g. to point the sandbox
/// worktrees at a temp directory).
pub async fn test_app_with(customize: impl FnOnce(&mut Config)) -> Arc<App> {
    let pool = create_migrated_test_pool().await.unwrap();
    let mut config = Config::default();
    config.events.persist = true;
    customize(&mut config);
    Arc::new(App::build_with_pool(&config, pool).unwrap())
}

/// Create a project with the default phases installed.
pub async fn seed_project(app: &App, autonomous: bool, max_concurrent: u32) -> Project {
    let project = Project::new("fixture", "/tmp/fixture-repo", "phase-requirements")
        .with_autonomous_mode(autonomous)
        .with_max_concurrent(max_concurrent);
    app.projects.create(&project).await.unwrap();
    app.registry.install_defaults(project.id).await.unwrap();
    project
}

pub async fn seed_ticket(app: &App, project: &Project) -> Ticket {
    let ticket = Ticket::new(project.id, "Fixture ticket", project.default_phase_id.clone());
    app.tickets.create(&ticket).await.unwrap();
    ticket
}

pub async fn seed_task(app: &App, ticket: &Ticket, description: &str) -> Task {
    let task = Task::new(ticket.id, ticket.project_id, ticket.current_phase.clone(), description);
    app.queue.enqueue(task).await.unwrap()
}

pub async fn seed_task_with(
    app: &App,
    ticket: &Ticket,
    description: &str,
    priority: Priority,
    deps: Vec<uuid::Uuid>,
    files: Vec<String>,
) -> Task {
    let mut task = Task::new(ticket.id, ticket.project_id, ticket.current_phase.clone(), description)
        .with_priority(priority)
        .with_estimated_files(files);
    for dep in deps {
        task = task.with_dependency(dep);
    }
    app.queue.enqueue(task).await.unwrap()
}

/// Initialize a real git repository with one commit on `main`.
pub fn init_git_repo(path: &Path) {
    run(path, &["init", "-b", "main"]);
    run(path, &["config", "user.email", "fixture@example.com"]);
    run(path, &["config", "user.name", "Fixture"]);
    std::fs::write(path.join("README.md"), "fixture\n").unwrap();
    run(path, &["add", "."]);
    run(path, &["commit", "-m", "initial"]);
}

/// Commit a file onto a branch of the fixture repo.
pub fn commit_on_branch(repo: &Path, branch: &str, file: &str, content: &str) {
    run(repo, &["checkout", branch]);
    let full = repo.join(file);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(full, content).unwrap();
    run(repo, &["add", "."]);
    run(repo, &["commit", "-m", &format!("update {file}")]);
    run(repo, &["checkout", "main"]);
}

/// Poll `probe` until it returns `Some`, panicking after `timeout`.
pub async fn wait_for<T, F, Fut>(timeout: std::time::Duration, description: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {description}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
}

pub fn run(dir: &Path, args: &[&str]) {
    let output = Command::new("git").arg("-C").arg(dir).args(args).output().unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
