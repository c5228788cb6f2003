//! Task domain model.
//!
//! Tasks are the smallest units the orchestrator schedules. They form a DAG
//! with dependencies and belong to exactly one ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a task in the scheduling pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Defined; waiting for dependencies and a claim.
    Pending,
    /// Atomically claimed by an orchestrator worker.
    Assigned,
    /// Executing inside a sandbox.
    Running,
    /// Finished successfully; result payload recorded.
    Completed,
    /// Execution failed.
    Failed,
    /// Cancelled by the orchestrator or an operator.
    Cancelled,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// In-flight states count against concurrency ceilings.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }

    /// Valid transitions from this status.
    ///
    /// The only loop is `Failed -> Pending`, the retry path.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Assigned, Self::Cancelled],
            // Assigned may fail without ever running (sandbox spawn errors).
            Self::Assigned => &[Self::Running, Self::Pending, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Completed => &[],
            Self::Failed => &[Self::Pending],
            Self::Cancelled => &[Self::Pending],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Priority level for tasks and tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "normal" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// One level up; `Critical` saturates.
    pub fn boosted(&self) -> Self {
        match self {
            Self::Low => Self::Medium,
            Self::Medium => Self::High,
            Self::High | Self::Critical => Self::Critical,
        }
    }
}

/// Semantic tag for the class of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// General-purpose implementation task (default).
    Standard,
    /// Research or analysis task (read-only, produces findings).
    Research,
    /// Code review task.
    Review,
    /// Continuation task that synthesizes parallel branches.
    Synthesis,
}

impl Default for TaskType {
    fn default() -> Self {
        Self::Standard
    }
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Research => "research",
            Self::Review => "review",
            Self::Synthesis => "synthesis",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "research" => Some(Self::Research),
            "review" => Some(Self::Review),
            "synthesis" => Some(Self::Synthesis),
            _ => None,
        }
    }
}

/// A discrete unit of work scheduled by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier
    pub id: Uuid,
    /// Owning ticket
    pub ticket_id: Uuid,
    /// Owning project (denormalized for claim queries)
    pub project_id: Uuid,
    /// Phase the task executes in
    pub phase_id: String,
    /// Detailed description/prompt
    pub description: String,
    /// Class of work
    pub task_type: TaskType,
    /// Current status
    pub status: TaskStatus,
    /// Priority
    pub priority: Priority,
    /// Sandbox executing this task, set while in flight
    pub sandbox_id: Option<Uuid>,
    /// Agent that claimed the task
    pub agent_id: Option<String>,
    /// Task IDs this depends on
    pub depends_on: Vec<Uuid>,
    /// File paths the task expects to touch (ownership validation)
    pub estimated_files: Vec<String>,
    /// Result payload, set on completion
    pub result: Option<serde_json::Value>,
    /// Merged upstream results, written by synthesis
    pub synthesis_context: Option<serde_json::Value>,
    /// Explicit user release for non-autonomous projects
    pub manual_release: bool,
    /// Retry count
    pub retry_count: u32,
    /// Maximum retries
    pub max_retries: u32,
    /// Last failure surfaced to the UI
    pub last_error: Option<String>,
    /// Version for optimistic concurrency
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task for a ticket.
    pub fn new(
        ticket_id: Uuid,
        project_id: Uuid,
        phase_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            project_id,
            phase_id: phase_id.into(),
            description: description.into(),
            task_type: TaskType::default(),
            status: TaskStatus::default(),
            priority: Priority::default(),
            sandbox_id: None,
            agent_id: None,
            depends_on: Vec::new(),
            estimated_files: Vec::new(),
            result: None,
            synthesis_context: None,
            manual_release: false,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            version: 1,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Add a dependency. Self-dependencies are ignored.
    pub fn with_dependency(mut self, task_id: Uuid) -> Self {
        if !self.depends_on.contains(&task_id) && task_id != self.id {
            self.depends_on.push(task_id);
        }
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }

    pub fn with_estimated_files(mut self, files: Vec<String>) -> Self {
        self.estimated_files = files;
        self
    }

    pub fn with_manual_release(mut self) -> Self {
        self.manual_release = true;
        self
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, updating timestamps and version.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        self.version += 1;

        match new_status {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, TaskStatus::Failed | TaskStatus::Cancelled)
            && self.retry_count < self.max_retries
    }

    /// Increment retry count and reset to Pending for another attempt.
    pub fn retry(&mut self) -> Result<(), String> {
        if !self.can_retry() {
            return Err("Cannot retry: either not failed/cancelled or max retries reached".to_string());
        }
        self.retry_count += 1;
        self.sandbox_id = None;
        self.agent_id = None;
        self.transition_to(TaskStatus::Pending)
    }

    /// Validate structural invariants before persistence.
    pub fn validate(&self) -> Result<(), String> {
        if self.description.trim().is_empty() {
            return Err("Task description cannot be empty".to_string());
        }
        if self.depends_on.contains(&self.id) {
            return Err("Task cannot depend on itself".to_string());
        }
        Ok(())
    }

    /// Git branch carrying this task's commits.
    pub fn branch_name(&self) -> String {
        format!("task/{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(Uuid::new_v4(), Uuid::new_v4(), "phase-implementation", "Do the thing")
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut t = task();
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        t.transition_to(TaskStatus::Completed).unwrap();
        assert!(t.completed_at.is_some());
        assert!(t.is_terminal());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut t = task();
        // Pending -> Running must go through Assigned
        assert!(t.transition_to(TaskStatus::Running).is_err());
        // Pending -> Completed is never valid
        assert!(t.transition_to(TaskStatus::Completed).is_err());

        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Completed).unwrap();
        // Terminal: nothing leaves Completed
        assert!(t.transition_to(TaskStatus::Pending).is_err());
        assert!(t.transition_to(TaskStatus::Running).is_err());
    }

    #[test]
    fn test_assigned_can_return_to_pending() {
        // Deferral path: a claimed task whose files are locked goes back.
        let mut t = task();
        t.transition_to(TaskStatus::Assigned).unwrap();
        assert!(t.transition_to(TaskStatus::Pending).is_ok());
    }

    #[test]
    fn test_retry_loop() {
        let mut t = task();
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Failed).unwrap();

        assert!(t.can_retry());
        let v = t.version;
        t.retry().unwrap();
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.retry_count, 1);
        assert!(t.sandbox_id.is_none());
        assert_eq!(t.version, v + 1);
    }

    #[test]
    fn test_retry_exhaustion() {
        let mut t = task();
        t.max_retries = 1;
        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Failed).unwrap();
        t.retry().unwrap();

        t.transition_to(TaskStatus::Assigned).unwrap();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Failed).unwrap();
        assert!(!t.can_retry());
        assert!(t.retry().is_err());
    }

    #[test]
    fn test_priority_boost_saturates() {
        assert_eq!(Priority::Low.boosted(), Priority::Medium);
        assert_eq!(Priority::Medium.boosted(), Priority::High);
        assert_eq!(Priority::High.boosted(), Priority::Critical);
        assert_eq!(Priority::Critical.boosted(), Priority::Critical);
    }

    #[test]
    fn test_self_dependency_rejected() {
        let t = task();
        let id = t.id;
        let t = t.with_dependency(id);
        assert!(t.depends_on.is_empty());
    }

    #[test]
    fn test_validation() {
        let mut t = task();
        t.description = "   ".to_string();
        assert!(t.validate().is_err());
    }
}
