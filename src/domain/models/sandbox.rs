//! Sandbox domain model.
//!
//! A sandbox is an isolated workspace (git worktree on a per-task branch plus
//! an environment) in which an agent executes exactly one task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    Local,
    Container,
    Remote,
    /// Short-lived workspace used only for convergence merges.
    Merge,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Container => "container",
            Self::Remote => "remote",
            Self::Merge => "merge",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "container" => Some(Self::Container),
            "remote" => Some(Self::Remote),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Starting,
    Running,
    Paused,
    Terminated,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// An isolated execution context for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: Uuid,
    pub task_id: Uuid,
    pub ticket_id: Uuid,
    pub workspace_path: String,
    /// Branch checked out in the workspace (`task/<task_id>`, or the ticket
    /// branch for merge sandboxes).
    pub branch: String,
    pub base_branch: String,
    pub kind: SandboxKind,
    /// Sandbox whose workspace this one inherited (resumption).
    pub parent_sandbox_id: Option<Uuid>,
    pub status: SandboxStatus,
    /// Key into the session transcript store, set once a transcript exists.
    pub transcript_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sandbox {
    pub fn new(
        task_id: Uuid,
        ticket_id: Uuid,
        workspace_path: impl Into<String>,
        branch: impl Into<String>,
        base_branch: impl Into<String>,
        kind: SandboxKind,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            ticket_id,
            workspace_path: workspace_path.into(),
            branch: branch.into(),
            base_branch: base_branch.into(),
            kind,
            parent_sandbox_id: None,
            status: SandboxStatus::Starting,
            transcript_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_sandbox_id = Some(parent);
        self
    }
}

/// A captured agent session, keyed by (task, phase), stored as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTranscript {
    pub task_id: Uuid,
    pub phase_id: String,
    pub transcript_b64: String,
    pub captured_at: DateTime<Utc>,
}

/// Environment variable names injected into every task sandbox.
pub mod env_keys {
    pub const TASK_ID: &str = "TASK_ID";
    pub const TICKET_ID: &str = "TICKET_ID";
    pub const PHASE_ID: &str = "PHASE_ID";
    pub const PROJECT_ID: &str = "PROJECT_ID";
    pub const EVENT_PUBLISH_URL: &str = "EVENT_PUBLISH_URL";
    pub const TASK_COMPLETE_URL: &str = "TASK_COMPLETE_URL";
    pub const RESUME_SESSION_ID: &str = "RESUME_SESSION_ID";
    pub const SESSION_TRANSCRIPT_B64: &str = "SESSION_TRANSCRIPT_B64";
    pub const FORK_SESSION: &str = "FORK_SESSION";
}

/// Directories materialized inside every task workspace.
pub const PLANNING_DIRS: &[&str] = &[
    ".planning/phase_data",
    ".planning/session_transcripts",
    ".planning/checkpoints",
    "requirements",
    "designs",
    "tickets",
    "tasks",
];
