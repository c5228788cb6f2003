//! Ticket domain model.
//!
//! Tickets are the user-visible units of work on the board. Many tasks are
//! scheduled per ticket; the ticket's phase gates their progression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::Priority;

/// Board status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Backlog,
    Active,
    Blocked,
    Done,
}

impl Default for TicketStatus {
    fn default() -> Self {
        Self::Backlog
    }
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Active => "active",
            Self::Blocked => "blocked",
            Self::Done => "done",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "backlog" => Some(Self::Backlog),
            "active" => Some(Self::Active),
            "blocked" => Some(Self::Blocked),
            "done" => Some(Self::Done),
            _ => None,
        }
    }
}

/// A unit of work tracked on the board.
///
/// All writes go through optimistic concurrency: `version` is incremented on
/// every update and repository writes are guarded with
/// `WHERE id = ? AND version = ?`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: String,
    /// Must name a phase registered for the project.
    pub current_phase: String,
    pub status: TicketStatus,
    pub priority: Priority,
    /// Tickets that must finish before this one. No self-references, no cycles.
    pub blocked_by: Vec<Uuid>,
    /// Linked spec document, when the planner produced one.
    pub spec_id: Option<Uuid>,
    /// Opaque synthesis payload accumulated at convergence points.
    pub synthesis_context: Option<serde_json::Value>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(project_id: Uuid, title: impl Into<String>, current_phase: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            description: String::new(),
            current_phase: current_phase.into(),
            status: TicketStatus::default(),
            priority: Priority::default(),
            blocked_by: Vec::new(),
            spec_id: None,
            synthesis_context: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_blocked_by(mut self, ticket_id: Uuid) -> Self {
        if ticket_id != self.id && !self.blocked_by.contains(&ticket_id) {
            self.blocked_by.push(ticket_id);
        }
        self
    }

    /// Record a mutation for the optimistic write path.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.version += 1;
    }

    /// Git branch all of this ticket's task branches derive from.
    pub fn branch_name(&self) -> String {
        format!("ticket/{}", self.id)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Ticket title cannot be empty".to_string());
        }
        if self.blocked_by.contains(&self.id) {
            return Err("Ticket cannot block itself".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_block_ignored_by_builder() {
        let t = Ticket::new(Uuid::new_v4(), "T", "phase-plan");
        let id = t.id;
        let t = t.with_blocked_by(id);
        assert!(t.blocked_by.is_empty());
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut t = Ticket::new(Uuid::new_v4(), "T", "phase-plan");
        let v = t.version;
        t.touch();
        assert_eq!(t.version, v + 1);
    }

    #[test]
    fn test_branch_name() {
        let t = Ticket::new(Uuid::new_v4(), "T", "phase-plan");
        assert!(t.branch_name().starts_with("ticket/"));
    }
}
