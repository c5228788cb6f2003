//! Task queue service: DAG-validated enqueue, atomic claim, completion
//! transitions, and unblock recomputation.
//!
//! Every status change publishes its event; the claim path and the
//! completion paths delegate to single guarded statements in the
//! repository, which serializes a task's transitions.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Task, TaskDag, TaskStatus};
use crate::domain::ports::{ClaimFilter, TaskFilter, TaskRepository};

use super::event_bus::EventBus;
use super::events::EventPayload;

pub struct TaskQueue {
    repo: Arc<dyn TaskRepository>,
    bus: Arc<EventBus>,
}

impl TaskQueue {
    pub fn new(repo: Arc<dyn TaskRepository>, bus: Arc<EventBus>) -> Self {
        Self { repo, bus }
    }

    pub fn repo(&self) -> &Arc<dyn TaskRepository> {
        &self.repo
    }

    /// Insert a task after validating that its dependency edges keep the
    /// ticket's graph acyclic. Publishes `task.created`.
    #[instrument(skip(self, task), fields(task_id = %task.id, ticket_id = %task.ticket_id))]
    pub async fn enqueue(&self, task: Task) -> DomainResult<Task> {
        task.validate().map_err(DomainError::ValidationFailed)?;

        if !task.depends_on.is_empty() {
            // Dependencies must stay within the project.
            for dep_id in &task.depends_on {
                let dep = self
                    .repo
                    .get(*dep_id)
                    .await?
                    .ok_or(DomainError::TaskNotFound(*dep_id))?;
                if dep.project_id != task.project_id {
                    return Err(DomainError::ValidationFailed(format!(
                        "Dependency {dep_id} belongs to another project"
                    )));
                }
            }

            let existing = self
                .repo
                .list(TaskFilter { project_id: Some(task.project_id), ..Default::default() })
                .await?;
            let mut dag = TaskDag::from_edges(
                existing.iter().map(|t| (t.id, t.depends_on.clone())),
            );
            dag.validate_addition(task.id, &task.depends_on)
                .map_err(|_| DomainError::DependencyCycle(task.id))?;
        }

        self.repo.create(&task).await?;
        self.bus
            .publish(EventPayload::TaskCreated {
                task_id: task.id,
                ticket_id: task.ticket_id,
                phase_id: task.phase_id.clone(),
                priority: task.priority,
                dependencies: task.depends_on.clone(),
            })
            .await;
        info!("Task enqueued");
        Ok(task)
    }

    /// Atomically claim the best eligible task for `agent_id`.
    pub async fn claim_next(&self, agent_id: &str, filter: &ClaimFilter) -> DomainResult<Option<Task>> {
        self.repo.claim_next_eligible(agent_id, filter).await
    }

    /// Preview eligible work without claiming.
    pub async fn get_ready_batch(&self, phase_id: Option<&str>, limit: usize) -> DomainResult<Vec<Task>> {
        self.repo.get_ready_batch(phase_id, limit).await
    }

    /// Record the sandbox and move assigned→running.
    pub async fn mark_running(&self, task_id: Uuid, sandbox_id: Uuid) -> DomainResult<()> {
        if !self.repo.mark_running(task_id, sandbox_id).await? {
            return Err(DomainError::InvalidStateTransition {
                from: "non-assigned".to_string(),
                to: TaskStatus::Running.as_str().to_string(),
            });
        }
        Ok(())
    }

    /// Complete a task and publish `task.completed`. Idempotent: replaying a
    /// completion for an already-terminal task is a no-op returning false.
    pub async fn complete(&self, task_id: Uuid, result: serde_json::Value) -> DomainResult<bool> {
        let transitioned = self.repo.mark_completed(task_id, &result).await?;
        if transitioned {
            self.bus
                .publish(EventPayload::TaskCompleted { task_id, result })
                .await;
        }
        Ok(transitioned)
    }

    /// Fail a task and publish `task.failed`.
    pub async fn fail(&self, task_id: Uuid, reason: &str) -> DomainResult<bool> {
        let transitioned = self.repo.mark_failed(task_id, reason).await?;
        if transitioned {
            warn!(%task_id, reason, "Task failed");
            self.bus
                .publish(EventPayload::TaskFailed { task_id, reason: reason.to_string() })
                .await;
        }
        Ok(transitioned)
    }

    /// Cancel a task and publish `task.cancelled`.
    pub async fn cancel(&self, task_id: Uuid) -> DomainResult<bool> {
        let transitioned = self.repo.mark_cancelled(task_id).await?;
        if transitioned {
            self.bus.publish(EventPayload::TaskCancelled { task_id }).await;
        }
        Ok(transitioned)
    }

    /// Return an assigned task to pending without burning a retry (used when
    /// its files are locked and the claim is deferred).
    pub async fn defer(&self, task_id: Uuid) -> DomainResult<bool> {
        self.repo.release_claim(task_id).await
    }

    /// Failed/cancelled → pending with retry_count incremented.
    pub async fn requeue_for_retry(&self, task_id: Uuid) -> DomainResult<bool> {
        self.repo.requeue_for_retry(task_id).await
    }

    /// Tasks whose last blocking dependency just resolved. Publishes
    /// `tasks.unblocked` when the set is non-empty.
    pub async fn recompute_unblocked(&self, completed_task_id: Uuid) -> DomainResult<Vec<Task>> {
        let unblocked = self.repo.find_unblocked_by(completed_task_id).await?;
        if !unblocked.is_empty() {
            self.bus
                .publish(EventPayload::TasksUnblocked {
                    completed_task_id,
                    unblocked_ids: unblocked.iter().map(|t| t.id).collect(),
                })
                .await;
        }
        Ok(unblocked)
    }

    pub async fn get(&self, task_id: Uuid) -> DomainResult<Option<Task>> {
        self.repo.get(task_id).await
    }

    pub async fn count_in_flight(&self, project_id: Option<Uuid>) -> DomainResult<u64> {
        self.repo.count_in_flight(project_id).await
    }
}
