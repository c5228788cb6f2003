//! Task repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Priority, Task, TaskStatus, TaskType};

/// Filter criteria for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub ticket_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub phase_id: Option<String>,
}

/// Constraints applied by the atomic claim query.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    /// Restrict to tasks in this phase.
    pub phase_id: Option<String>,
    /// Task types the claiming agent can execute. Empty = any.
    pub capabilities: Vec<TaskType>,
    /// When true, only tasks of autonomous-mode projects are claimable;
    /// when false, manually released tasks of any project also qualify.
    pub autonomous_only: bool,
}

/// Repository interface for Task persistence.
///
/// `claim_next_eligible` and the completion methods are single-statement
/// conditional updates so concurrent orchestrator instances can never
/// double-assign or double-complete a task.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>>;

    /// Optimistic write: fails with `ConcurrencyConflict` when the stored
    /// version differs from `task.version - 1`.
    async fn update(&self, task: &Task) -> DomainResult<()>;

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>>;

    /// Atomically pick the best eligible task and mark it assigned to
    /// `agent_id`. Eligibility: pending, no sandbox, all dependencies
    /// completed, project ceiling not exceeded, autonomous/manual gate
    /// passed. Priority order, then FIFO. Returns `None` when nothing is
    /// claimable.
    async fn claim_next_eligible(&self, agent_id: &str, filter: &ClaimFilter) -> DomainResult<Option<Task>>;

    /// Up to `limit` eligible pending tasks in priority order, without
    /// claiming them.
    async fn get_ready_batch(&self, phase_id: Option<&str>, limit: usize) -> DomainResult<Vec<Task>>;

    /// Status-guarded transition assigned→running, recording the sandbox.
    async fn mark_running(&self, task_id: Uuid, sandbox_id: Uuid) -> DomainResult<bool>;

    /// Status-guarded completion; stores the result payload. Returns false
    /// when the task was not in an in-flight state (idempotent replay).
    async fn mark_completed(&self, task_id: Uuid, result: &serde_json::Value) -> DomainResult<bool>;

    /// Status-guarded failure; stores the reason.
    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> DomainResult<bool>;

    /// Status-guarded cancellation from any non-terminal state.
    async fn mark_cancelled(&self, task_id: Uuid) -> DomainResult<bool>;

    /// Return an assigned task to pending (claim deferral). Guarded on
    /// status = assigned.
    async fn release_claim(&self, task_id: Uuid) -> DomainResult<bool>;

    /// Failed/cancelled → pending with retry_count incremented; clears the
    /// sandbox assignment.
    async fn requeue_for_retry(&self, task_id: Uuid) -> DomainResult<bool>;

    /// Surface an error on the task without changing its status (e.g. a
    /// merge conflict hit before the task ever started).
    async fn record_error(&self, task_id: Uuid, reason: &str) -> DomainResult<()>;

    /// Set the synthesis context on a continuation task.
    async fn set_synthesis_context(&self, task_id: Uuid, context: &serde_json::Value) -> DomainResult<()>;

    /// Flip the manual release flag (non-autonomous projects).
    async fn set_manual_release(&self, task_id: Uuid, released: bool) -> DomainResult<()>;

    async fn get_dependencies(&self, task_id: Uuid) -> DomainResult<Vec<Task>>;

    async fn get_dependents(&self, task_id: Uuid) -> DomainResult<Vec<Task>>;

    async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> DomainResult<()>;

    /// Tasks whose last incomplete dependency was `completed_task_id`:
    /// pending, unassigned, and now fully unblocked.
    async fn find_unblocked_by(&self, completed_task_id: Uuid) -> DomainResult<Vec<Task>>;

    /// Count of in-flight (assigned or running) tasks, optionally scoped to
    /// a project.
    async fn count_in_flight(&self, project_id: Option<Uuid>) -> DomainResult<u64>;

    /// All tasks currently marked running (guardian + reconciliation).
    async fn list_running(&self) -> DomainResult<Vec<Task>>;

    /// Crash recovery: force assigned/running tasks whose sandbox is gone
    /// back to pending. Returns the number repaired.
    async fn reset_orphaned(&self, live_sandbox_ids: &[Uuid]) -> DomainResult<u64>;
}
