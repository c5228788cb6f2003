//! Convergence merger: reconciles parallel task branches into the
//! continuation branch once synthesis completes.
//!
//! The handler arranges its own environment and never assumes the
//! continuation task's sandbox exists. It requests a merge workspace with
//! the ticket branch checked out, merges each source task's branch in
//! deterministic (priority, id) order, and records every attempt in the
//! durable merge log.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    JoinStatus, MergeAttempt, MergeAttemptOutcome, Task, TicketStatus,
};
use crate::domain::ports::{JoinRepository, ProjectRepository, TicketRepository};

use super::event_bus::EventBus;
use super::events::{Event, EventPayload};
use super::sandbox_spawner::{run_git, SandboxSpawner};
use super::task_queue::TaskQueue;

/// External conflict resolution (LLM-based in production). Implementations
/// edit the conflicted files in the workspace and return a description of
/// the resolution; an error leaves the merge conflicted.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(
        &self,
        workspace: &Path,
        conflict_files: &[String],
        source_branch: &str,
    ) -> DomainResult<String>;
}

/// Resolver that never resolves: every conflict escalates to a human.
pub struct NoopConflictResolver;

#[async_trait]
impl ConflictResolver for NoopConflictResolver {
    async fn resolve(&self, _: &Path, files: &[String], branch: &str) -> DomainResult<String> {
        Err(DomainError::PermanentExternal(format!(
            "No conflict resolver configured for {branch} ({} conflicted file(s))",
            files.len()
        )))
    }
}

#[derive(Debug, Clone)]
pub struct MergerConfig {
    /// Base branch ticket branches derive from.
    pub base_branch: String,
    /// Resolver invocations allowed per conflicted source branch.
    pub max_resolution_attempts: u32,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            max_resolution_attempts: 2,
        }
    }
}

pub struct ConvergenceMerger {
    queue: Arc<TaskQueue>,
    tickets: Arc<dyn TicketRepository>,
    projects: Arc<dyn ProjectRepository>,
    joins: Arc<dyn JoinRepository>,
    spawner: Arc<SandboxSpawner>,
    resolver: Arc<dyn ConflictResolver>,
    bus: Arc<EventBus>,
    config: MergerConfig,
    /// Serializes merge runs: the synthesis event handler and the claim
    /// worker can both request the same workspace.
    merge_gate: tokio::sync::Mutex<()>,
}

impl ConvergenceMerger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        tickets: Arc<dyn TicketRepository>,
        projects: Arc<dyn ProjectRepository>,
        joins: Arc<dyn JoinRepository>,
        spawner: Arc<SandboxSpawner>,
        resolver: Arc<dyn ConflictResolver>,
        bus: Arc<EventBus>,
        config: MergerConfig,
    ) -> Self {
        Self {
            queue,
            tickets,
            projects,
            joins,
            spawner,
            resolver,
            bus,
            config,
            merge_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe to `coordination.synthesis.completed`.
    pub async fn register_handlers(self: &Arc<Self>) {
        let merger = Arc::clone(self);
        self.bus
            .subscribe(
                "coordination.synthesis.completed",
                Arc::new(move |event: Event| {
                    let merger = Arc::clone(&merger);
                    Box::pin(async move {
                        if let EventPayload::SynthesisCompleted { continuation_task_id, .. } = event.payload {
                            if let Err(e) = merger.prepare_workspace(continuation_task_id).await {
                                warn!(%continuation_task_id, "Convergence merge failed: {e}");
                            }
                        }
                    })
                }),
            )
            .await;
    }

    /// Merge all of the continuation task's source branches into the ticket
    /// branch. On success the continuation workspace is tagged ready; on an
    /// irresolvable conflict the continuation fails with a merge-conflict
    /// reason and the ticket blocks for human resolution.
    #[instrument(skip(self))]
    pub async fn prepare_workspace(&self, continuation_task_id: Uuid) -> DomainResult<()> {
        let _gate = self.merge_gate.lock().await;

        let continuation = self
            .queue
            .get(continuation_task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(continuation_task_id))?;
        let Some(join) = self.joins.get_by_continuation(continuation_task_id).await? else {
            return Err(DomainError::JoinNotFound(continuation_task_id));
        };
        if matches!(join.status, JoinStatus::Merged | JoinStatus::Failed) {
            return Ok(()); // A concurrent run already settled this join.
        }
        let ticket = self
            .tickets
            .get(continuation.ticket_id)
            .await?
            .ok_or(DomainError::TicketNotFound(continuation.ticket_id))?;
        let project = self
            .projects
            .get(ticket.project_id)
            .await?
            .ok_or(DomainError::ProjectNotFound(ticket.project_id))?;

        let sandbox = self
            .spawner
            .create_merge_sandbox(&ticket, &project, &self.config.base_branch)
            .await?;
        let workspace = Path::new(&sandbox.workspace_path).to_path_buf();

        // Deterministic order: priority (critical first), then id.
        let mut sources: Vec<Task> = Vec::new();
        for id in &join.source_task_ids {
            sources.push(self.queue.get(*id).await?.ok_or(DomainError::TaskNotFound(*id))?);
        }
        sources.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        for (ordinal, source) in sources.iter().enumerate() {
            let outcome = self
                .merge_source(&workspace, join.id, source, ordinal as u32)
                .await;
            if let Err(e) = outcome {
                self.fail_merge(&join.id, continuation_task_id, ticket.id, &e.to_string())
                    .await?;
                self.spawner.terminate(sandbox.id).await.ok();
                return Ok(());
            }
        }

        // Tag the continuation workspace ready for the upcoming sandbox.
        let mut context = continuation.synthesis_context.unwrap_or_else(|| json!({}));
        if let Value::Object(ref mut map) = context {
            map.insert("workspace_ready".to_string(), Value::Bool(true));
        }
        self.queue.repo().set_synthesis_context(continuation_task_id, &context).await?;

        let mut merged_join = join;
        merged_join.status = JoinStatus::Merged;
        merged_join.updated_at = Utc::now();
        self.joins.update(&merged_join).await?;

        info!(%continuation_task_id, sources = sources.len(), "Branches converged");
        self.bus
            .publish(EventPayload::MergeSucceeded {
                continuation_task_id,
                detail: format!("{} source branch(es) merged", sources.len()),
            })
            .await;
        self.spawner.terminate(sandbox.id).await?;
        Ok(())
    }

    async fn merge_source(
        &self,
        workspace: &Path,
        join_id: Uuid,
        source: &Task,
        ordinal: u32,
    ) -> DomainResult<()> {
        let branch = source.branch_name();
        let message = format!("Merge {branch}");

        if run_git(workspace, &["merge", "--no-ff", "-m", &message, &branch]).await.is_ok() {
            self.joins
                .append_merge_attempt(&MergeAttempt {
                    join_id,
                    source_task_id: source.id,
                    ordinal,
                    outcome: MergeAttemptOutcome::Clean,
                    conflict_files: Vec::new(),
                    resolution: None,
                    created_at: Utc::now(),
                })
                .await?;
            return Ok(());
        }

        let conflict_files = self.conflicted_files(workspace).await;
        warn!(%branch, files = conflict_files.len(), "Merge conflict");

        for attempt in 1..=self.config.max_resolution_attempts {
            match self.resolver.resolve(workspace, &conflict_files, &branch).await {
                Ok(resolution) => {
                    run_git(workspace, &["add", "-A"]).await?;
                    run_git(workspace, &["commit", "--no-edit"]).await?;
                    self.joins
                        .append_merge_attempt(&MergeAttempt {
                            join_id,
                            source_task_id: source.id,
                            ordinal,
                            outcome: MergeAttemptOutcome::Resolved,
                            conflict_files: conflict_files.clone(),
                            resolution: Some(resolution),
                            created_at: Utc::now(),
                        })
                        .await?;
                    return Ok(());
                }
                Err(e) => {
                    self.joins
                        .append_merge_attempt(&MergeAttempt {
                            join_id,
                            source_task_id: source.id,
                            ordinal,
                            outcome: MergeAttemptOutcome::Conflict,
                            conflict_files: conflict_files.clone(),
                            resolution: Some(format!("attempt {attempt} failed: {e}")),
                            created_at: Utc::now(),
                        })
                        .await?;
                }
            }
        }

        run_git(workspace, &["merge", "--abort"]).await.ok();
        Err(DomainError::PermanentExternal(format!(
            "Unresolved merge conflict on {branch}: {}",
            conflict_files.join(", ")
        )))
    }

    async fn conflicted_files(&self, workspace: &Path) -> Vec<String> {
        run_git(workspace, &["diff", "--name-only", "--diff-filter=U"])
            .await
            .map(|out| out.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    async fn fail_merge(
        &self,
        join_id: &Uuid,
        continuation_task_id: Uuid,
        ticket_id: Uuid,
        detail: &str,
    ) -> DomainResult<()> {
        if let Some(mut join) = self.joins.get(*join_id).await? {
            join.status = JoinStatus::Failed;
            join.updated_at = Utc::now();
            self.joins.update(&join).await.ok();
        }

        // The continuation cannot run until a human resolves the branches.
        // The failure is recorded directly (no task.failed event, which
        // would schedule an automatic retry of a merge that cannot succeed)
        // and the ticket blocks, which withholds its tasks from claiming.
        let failed = self.queue.repo().mark_failed(continuation_task_id, "merge-conflict").await?;
        if !failed {
            self.queue.repo().record_error(continuation_task_id, "merge-conflict").await?;
        }
        if let Some(mut ticket) = self.tickets.get(ticket_id).await? {
            ticket.status = TicketStatus::Blocked;
            ticket.touch();
            self.tickets.update(&ticket).await?;
        }

        self.bus
            .publish(EventPayload::MergeFailed {
                continuation_task_id,
                detail: detail.to_string(),
            })
            .await;
        Ok(())
    }
}
