//! Sandbox lifecycle: git-worktree workspaces on per-task branches, runtime
//! process spawn/teardown, and session-transcript checkpointing.
//!
//! Branch model: `task/<task_id>` derives from `ticket/<ticket_id>`, which
//! derives from the project's base branch. Merge sandboxes check out the
//! ticket branch itself; their worktree doubles as the ticket workspace that
//! gate artifact checks read, so terminating a merge sandbox keeps the
//! directory on disk.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    sandbox::env_keys, Project, Sandbox, SandboxKind, SandboxStatus, SessionTranscript, Task,
    Ticket, PLANNING_DIRS,
};
use crate::domain::ports::SandboxRepository;

use super::event_bus::EventBus;
use super::events::EventPayload;

/// Resumption data hydrated into a fresh sandbox.
#[derive(Debug, Clone)]
pub struct ResumeHandle {
    /// Prior session to resume (exported as RESUME_SESSION_ID).
    pub session_id: String,
    pub transcript_b64: String,
    /// Fork the session instead of continuing it in place.
    pub fork: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxSpawnerConfig {
    /// Directory all worktrees are created under.
    pub worktrees_root: PathBuf,
    /// Injected as EVENT_PUBLISH_URL.
    pub event_publish_url: String,
    /// Injected as TASK_COMPLETE_URL.
    pub task_complete_url: String,
    /// Agent runtime command line. `None` prepares workspaces without
    /// starting a process (tests, external runtimes).
    pub runtime_command: Option<Vec<String>>,
    /// Grace between SIGTERM and SIGKILL at teardown.
    pub terminate_grace: Duration,
}

impl Default for SandboxSpawnerConfig {
    fn default() -> Self {
        Self {
            worktrees_root: PathBuf::from(".foreman/worktrees"),
            event_publish_url: "http://127.0.0.1:9440/events".to_string(),
            task_complete_url: "http://127.0.0.1:9440/tasks/complete".to_string(),
            runtime_command: None,
            terminate_grace: Duration::from_secs(10),
        }
    }
}

pub struct SandboxSpawner {
    repo: Arc<dyn SandboxRepository>,
    bus: Arc<EventBus>,
    config: SandboxSpawnerConfig,
    children: Mutex<HashMap<Uuid, Child>>,
}

impl SandboxSpawner {
    pub fn new(repo: Arc<dyn SandboxRepository>, bus: Arc<EventBus>, config: SandboxSpawnerConfig) -> Self {
        Self {
            repo,
            bus,
            config,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SandboxSpawnerConfig {
        &self.config
    }

    /// Workspace directory a ticket's merge sandbox (and gate artifact
    /// checks) use.
    pub fn ticket_workspace_path(&self, ticket_id: Uuid) -> PathBuf {
        self.config.worktrees_root.join(format!("ticket-{ticket_id}"))
    }

    fn task_workspace_path(&self, task_id: Uuid) -> PathBuf {
        self.config.worktrees_root.join(format!("task-{task_id}"))
    }

    /// Prepare a workspace on the task's branch, materialize the planning
    /// tree, inject the environment, and start the runtime. Publishes
    /// `sandbox.spawned`.
    #[instrument(skip_all, fields(task_id = %task.id, ticket_id = %ticket.id))]
    pub async fn spawn_for_task(
        &self,
        task: &Task,
        ticket: &Ticket,
        project: &Project,
        base_branch: &str,
        extra_env: HashMap<String, String>,
        resume: Option<ResumeHandle>,
    ) -> DomainResult<Sandbox> {
        let repo_path = Path::new(&project.repo_path);
        let ticket_branch = ticket.branch_name();
        let task_branch = task.branch_name();
        let workspace = self.task_workspace_path(task.id);

        self.ensure_branch(repo_path, &ticket_branch, base_branch).await?;
        self.add_worktree(repo_path, &workspace, &task_branch, &ticket_branch).await?;
        materialize_planning_dirs(&workspace).await?;

        if let Some(ref handle) = resume {
            hydrate_transcript(&workspace, handle).await?;
        }

        let mut sandbox = Sandbox::new(
            task.id,
            ticket.id,
            workspace.display().to_string(),
            task_branch,
            ticket_branch,
            SandboxKind::Local,
        );
        if let Some(parent) = self.repo.get_by_task(task.id).await? {
            if parent.id != sandbox.id {
                sandbox = sandbox.with_parent(parent.id);
            }
        }
        self.repo.create(&sandbox).await?;

        let mut env = extra_env;
        env.insert(env_keys::TASK_ID.to_string(), task.id.to_string());
        env.insert(env_keys::TICKET_ID.to_string(), ticket.id.to_string());
        env.insert(env_keys::PHASE_ID.to_string(), task.phase_id.clone());
        env.insert(env_keys::PROJECT_ID.to_string(), project.id.to_string());
        env.insert(env_keys::EVENT_PUBLISH_URL.to_string(), self.config.event_publish_url.clone());
        env.insert(env_keys::TASK_COMPLETE_URL.to_string(), self.config.task_complete_url.clone());
        if let Some(handle) = resume {
            env.insert(env_keys::RESUME_SESSION_ID.to_string(), handle.session_id.clone());
            env.insert(env_keys::SESSION_TRANSCRIPT_B64.to_string(), handle.transcript_b64.clone());
            env.insert(env_keys::FORK_SESSION.to_string(), handle.fork.to_string());
        }

        if let Some(ref command) = self.config.runtime_command {
            let child = self.start_runtime(command, &workspace, &env)?;
            self.children.lock().await.insert(sandbox.id, child);
        }

        self.repo.set_status(sandbox.id, SandboxStatus::Running).await?;
        sandbox.status = SandboxStatus::Running;

        info!(sandbox_id = %sandbox.id, workspace = %sandbox.workspace_path, "Sandbox spawned");
        self.bus
            .publish(EventPayload::SandboxSpawned {
                sandbox_id: sandbox.id,
                task_id: task.id,
                workspace_path: sandbox.workspace_path.clone(),
            })
            .await;
        Ok(sandbox)
    }

    /// Lightweight merge workspace: the ticket branch checked out at the
    /// ticket workspace path, no runtime process.
    #[instrument(skip_all, fields(ticket_id = %ticket.id))]
    pub async fn create_merge_sandbox(&self, ticket: &Ticket, project: &Project, base_branch: &str) -> DomainResult<Sandbox> {
        let repo_path = Path::new(&project.repo_path);
        let ticket_branch = ticket.branch_name();
        let workspace = self.ticket_workspace_path(ticket.id);

        self.ensure_branch(repo_path, &ticket_branch, base_branch).await?;
        if !workspace.is_dir() {
            run_git(repo_path, &["worktree", "add", &workspace.display().to_string(), &ticket_branch]).await?;
        }

        let sandbox = Sandbox::new(
            Uuid::new_v4(), // merge sandboxes have no task of their own
            ticket.id,
            workspace.display().to_string(),
            ticket_branch.clone(),
            base_branch.to_string(),
            SandboxKind::Merge,
        );
        self.repo.create(&sandbox).await?;
        self.repo.set_status(sandbox.id, SandboxStatus::Running).await?;
        Ok(sandbox)
    }

    /// Tear a sandbox down: stop the runtime (SIGTERM, grace, SIGKILL),
    /// remove the worktree for task sandboxes, publish `sandbox.terminated`.
    #[instrument(skip(self))]
    pub async fn terminate(&self, sandbox_id: Uuid) -> DomainResult<()> {
        let Some(sandbox) = self.repo.get(sandbox_id).await? else {
            return Err(DomainError::SandboxNotFound(sandbox_id));
        };
        if sandbox.status == SandboxStatus::Terminated {
            return Ok(());
        }

        if let Some(mut child) = self.children.lock().await.remove(&sandbox_id) {
            self.stop_child(&mut child).await;
        }

        // Merge sandboxes leave their worktree behind: it IS the ticket
        // workspace that gate checks and the continuation task read.
        if sandbox.kind != SandboxKind::Merge {
            let workspace = Path::new(&sandbox.workspace_path);
            if workspace.is_dir() {
                if let Err(e) = remove_worktree(workspace).await {
                    warn!(%sandbox_id, "Worktree removal failed: {e}");
                }
            }
        }

        self.repo.set_status(sandbox_id, SandboxStatus::Terminated).await?;
        self.bus
            .publish(EventPayload::SandboxTerminated { sandbox_id, task_id: sandbox.task_id })
            .await;
        info!(%sandbox_id, "Sandbox terminated");
        Ok(())
    }

    /// Capture the newest session transcript from a sandbox workspace and
    /// persist it keyed by (task, phase). Returns false when none exists.
    pub async fn capture_transcript(&self, sandbox: &Sandbox, phase_id: &str) -> DomainResult<bool> {
        let transcripts_dir = Path::new(&sandbox.workspace_path).join(".planning/session_transcripts");
        let Some(path) = newest_file(&transcripts_dir).await else {
            return Ok(false);
        };
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| DomainError::PermanentExternal(format!("Cannot read transcript: {e}")))?;

        self.repo
            .save_transcript(&SessionTranscript {
                task_id: sandbox.task_id,
                phase_id: phase_id.to_string(),
                transcript_b64: BASE64.encode(&bytes),
                captured_at: Utc::now(),
            })
            .await?;
        debug!(task_id = %sandbox.task_id, "Transcript captured");
        Ok(true)
    }

    /// Saved transcript for a task/phase, as a resume handle.
    pub async fn resume_handle_for(&self, task_id: Uuid, phase_id: &str, fork: bool) -> DomainResult<Option<ResumeHandle>> {
        Ok(self
            .repo
            .get_transcript(task_id, phase_id)
            .await?
            .map(|t| ResumeHandle {
                session_id: format!("{}:{}", t.task_id, t.phase_id),
                transcript_b64: t.transcript_b64,
                fork,
            }))
    }

    /// Sandboxes recorded as live; used by startup reconciliation.
    pub async fn list_active(&self) -> DomainResult<Vec<Sandbox>> {
        self.repo.list_active().await
    }

    async fn ensure_branch(&self, repo_path: &Path, branch: &str, base: &str) -> DomainResult<()> {
        let exists = run_git(repo_path, &["rev-parse", "--verify", "--quiet", branch]).await.is_ok();
        if !exists {
            run_git(repo_path, &["branch", branch, base]).await?;
            debug!(branch, base, "Created branch");
        }
        Ok(())
    }

    async fn add_worktree(&self, repo_path: &Path, workspace: &Path, branch: &str, from: &str) -> DomainResult<()> {
        if workspace.is_dir() {
            return Ok(());
        }
        let workspace_str = workspace.display().to_string();
        let branch_exists = run_git(repo_path, &["rev-parse", "--verify", "--quiet", branch]).await.is_ok();
        if branch_exists {
            // Retry/resume: the task branch already carries commits.
            run_git(repo_path, &["worktree", "add", &workspace_str, branch]).await?;
        } else {
            run_git(repo_path, &["worktree", "add", "-b", branch, &workspace_str, from]).await?;
        }
        Ok(())
    }

    fn start_runtime(&self, command: &[String], workspace: &Path, env: &HashMap<String, String>) -> DomainResult<Child> {
        let Some((program, args)) = command.split_first() else {
            return Err(DomainError::ValidationFailed("Empty runtime command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(workspace)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn().map_err(|e| DomainError::TransientExternal {
            source_system: "sandbox-runtime".to_string(),
            attempts: 1,
            detail: format!("Failed to spawn runtime '{program}': {e}"),
        })
    }

    async fn stop_child(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            return; // Already reaped.
        };

        #[cfg(unix)]
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, "SIGTERM failed (process likely gone): {e}");
        }

        match tokio::time::timeout(self.config.terminate_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(pid, "Runtime ignored SIGTERM, killing");
                child.kill().await.ok();
            }
        }
    }
}

/// Run a git subcommand, returning trimmed stdout.
pub async fn run_git(repo_path: &Path, args: &[&str]) -> DomainResult<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo_path)
        .args(args)
        .output()
        .await
        .map_err(|e| DomainError::TransientExternal {
            source_system: "git".to_string(),
            attempts: 1,
            detail: format!("Failed to run git {args:?}: {e}"),
        })?;

    if !output.status.success() {
        return Err(DomainError::TransientExternal {
            source_system: "git".to_string(),
            attempts: 1,
            detail: format!(
                "git {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn remove_worktree(workspace: &Path) -> DomainResult<()> {
    // The owning repository is reachable from inside the worktree.
    let common = run_git(workspace, &["rev-parse", "--path-format=absolute", "--git-common-dir"]).await?;
    let repo_root = PathBuf::from(common).parent().map(Path::to_path_buf).ok_or_else(|| {
        DomainError::PermanentExternal("Cannot resolve repository root from worktree".to_string())
    })?;
    run_git(&repo_root, &["worktree", "remove", "--force", &workspace.display().to_string()]).await?;
    Ok(())
}

async fn materialize_planning_dirs(workspace: &Path) -> DomainResult<()> {
    for dir in PLANNING_DIRS {
        tokio::fs::create_dir_all(workspace.join(dir))
            .await
            .map_err(|e| DomainError::PermanentExternal(format!("Cannot create {dir}: {e}")))?;
    }
    Ok(())
}

async fn hydrate_transcript(workspace: &Path, handle: &ResumeHandle) -> DomainResult<()> {
    let bytes = BASE64
        .decode(handle.transcript_b64.as_bytes())
        .map_err(|e| DomainError::SerializationError(format!("Invalid transcript encoding: {e}")))?;
    let file_name = format!("{}.jsonl", handle.session_id.replace([':', '/'], "-"));
    let path = workspace.join(".planning/session_transcripts").join(file_name);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DomainError::PermanentExternal(format!("Cannot create transcript dir: {e}")))?;
    }
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| DomainError::PermanentExternal(format!("Cannot hydrate transcript: {e}")))?;
    Ok(())
}

async fn newest_file(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let meta = entry.metadata().await.ok()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().ok()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, entry.path()));
        }
    }
    newest.map(|(_, path)| path)
}
