//! Claim worker pipeline: claim → join registration → convergence merge →
//! ownership validation → lock acquisition → sandbox spawn.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{JoinStatus, Task, TaskStatus};

use super::super::events::EventPayload;
use super::super::lock_manager::is_contention;
use super::super::sandbox_spawner::ResumeHandle;
use super::Orchestrator;

impl Orchestrator {
    pub(crate) async fn run_worker(self: &std::sync::Arc<Self>, index: usize) {
        let agent_id = format!("orchestrator-worker-{index}");
        debug!(agent_id, "Worker started");

        loop {
            if self.is_shutting_down() {
                break;
            }

            if self.config.enforce_capacity && !self.capacity_available().await {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            let claimed = match self.queue.claim_next(&agent_id, &self.config.claim).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    warn!(agent_id, "Claim failed: {e}");
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let Some(task) = claimed else {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            // Per-task isolation: one task's error never kills the worker.
            if let Err(e) = self.process_claimed(&agent_id, task).await {
                warn!(agent_id, "Task pipeline error: {e}");
            }
        }
        debug!(agent_id, "Worker stopped");
    }

    /// Global in-flight count must stay under the sum of advertised agent
    /// capacities.
    async fn capacity_available(&self) -> bool {
        let advertised = self.guardian.total_advertised_capacity().await;
        let in_flight = self.queue.count_in_flight(None).await.unwrap_or(u64::MAX);
        in_flight < advertised
    }

    async fn process_claimed(self: &std::sync::Arc<Self>, agent_id: &str, task: Task) -> DomainResult<()> {
        debug!(task_id = %task.id, "Processing claimed task");

        // Read-time integrity check: a self-referential dependency set is
        // corrupt. Quarantine the record and alert an operator instead of
        // scheduling it.
        if task.depends_on.contains(&task.id) {
            self.bus
                .publish(EventPayload::OperatorAlert {
                    entity: "task".to_string(),
                    entity_id: task.id.to_string(),
                    detail: "task depends on itself; record quarantined".to_string(),
                })
                .await;
            self.queue.cancel(task.id).await?;
            return Err(DomainError::Corruption {
                entity: "task".to_string(),
                id: task.id.to_string(),
                detail: "self-referential dependency set".to_string(),
            });
        }

        // Multi-dependency tasks always have a join; auto-register the
        // missing ones with the combine strategy. At a convergence point the
        // parallel branches must be merged into the ticket branch before
        // this task's sandbox exists.
        if let Some(join) = self.coordination.ensure_join(&task).await? {
            match join.status {
                JoinStatus::Waiting => {
                    // Sources are still outstanding, or a sibling worker
                    // claimed this task in the window between the last
                    // source's guarded completion and its synthesis
                    // handler finishing. Claim again once the join fires.
                    debug!(task_id = %task.id, "Join not synthesized yet, deferring");
                    self.queue.defer(task.id).await?;
                    return Ok(());
                }
                JoinStatus::Ready => {
                    self.merger.prepare_workspace(task.id).await?;
                    let refreshed = self
                        .queue
                        .get(task.id)
                        .await?
                        .ok_or(DomainError::TaskNotFound(task.id))?;
                    if refreshed.status != TaskStatus::Assigned {
                        // The merger failed the task (conflict); move on.
                        self.locks.release_by_task(task.id).await?;
                        return Ok(());
                    }
                }
                JoinStatus::Merged => {} // Workspace already prepared.
                JoinStatus::Failed => {
                    // Synthesis missed its deadline or the merge conflicted;
                    // the continuation cannot produce a meaningful result.
                    warn!(task_id = %task.id, "Join failed, failing continuation");
                    if self.queue.fail(task.id, "join synthesis failed").await? {
                        self.post_failure(task.id, "join synthesis failed").await?;
                    }
                    return Ok(());
                }
            }
        }

        // Ownership validation: skip (defer) tasks whose declared files are
        // exclusively locked by live leases.
        if !task.estimated_files.is_empty() {
            if self.locks.any_file_conflict(&task.estimated_files, Some(task.id)).await? {
                debug!(task_id = %task.id, "Files locked, deferring");
                self.queue.defer(task.id).await?;
                return Ok(());
            }

            match self
                .locks
                .acquire_files(&task.estimated_files, task.id, agent_id, Some(self.config.lock_ttl))
                .await
            {
                Ok(_) => {}
                Err(e) if is_contention(&e) => {
                    debug!(task_id = %task.id, "Lost lock race, deferring");
                    self.queue.defer(task.id).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.spawn_and_start(agent_id, &task).await {
            warn!(task_id = %task.id, "Sandbox spawn failed: {e}");
            self.locks.release_by_task(task.id).await?;
            let reason = format!("sandbox spawn failed: {e}");
            if self.queue.fail(task.id, &reason).await? {
                self.post_failure(task.id, &reason).await?;
            }
        }
        Ok(())
    }

    async fn spawn_and_start(self: &std::sync::Arc<Self>, agent_id: &str, task: &Task) -> DomainResult<()> {
        let ticket = self
            .tickets
            .get(task.ticket_id)
            .await?
            .ok_or(DomainError::TicketNotFound(task.ticket_id))?;
        let project = self
            .projects
            .get(task.project_id)
            .await?
            .ok_or(DomainError::ProjectNotFound(task.project_id))?;

        // Retries resume from the prior session transcript when one was
        // checkpointed.
        let resume: Option<ResumeHandle> = if task.retry_count > 0 {
            self.spawner.resume_handle_for(task.id, &task.phase_id, false).await?
        } else {
            None
        };

        let seed = u64::from_le_bytes(task.id.as_bytes()[..8].try_into().unwrap_or_default());
        let sandbox = self
            .config
            .retry
            .run(seed, || {
                let task = task.clone();
                let ticket = ticket.clone();
                let project = project.clone();
                let resume = resume.clone();
                let base_branch = self.config.base_branch.clone();
                let spawner = std::sync::Arc::clone(&self.spawner);
                async move {
                    spawner
                        .spawn_for_task(&task, &ticket, &project, &base_branch, HashMap::new(), resume)
                        .await
                }
            })
            .await?;

        self.queue.mark_running(task.id, sandbox.id).await?;
        info!(task_id = %task.id, sandbox_id = %sandbox.id, "Task started");
        self.bus
            .publish(EventPayload::TaskStarted {
                task_id: task.id,
                sandbox_id: sandbox.id,
                agent_id: agent_id.to_string(),
            })
            .await;
        Ok(())
    }
}
