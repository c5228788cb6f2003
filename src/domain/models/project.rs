//! Project domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Organizational root. Tickets and phases hang off a project.
///
/// Projects are never deleted while tickets reference them; archival is the
/// only removal path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    /// Path to the git repository tasks operate on.
    pub repo_path: String,
    /// Phase newly created tickets enter.
    pub default_phase_id: String,
    /// When on, every eligible task is claimable without per-task user
    /// confirmation; when off, only explicitly released tasks run.
    pub autonomous_mode: bool,
    /// Ceiling on concurrently in-flight tasks for this project.
    pub max_concurrent: u32,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, repo_path: impl Into<String>, default_phase_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            repo_path: repo_path.into(),
            default_phase_id: default_phase_id.into(),
            autonomous_mode: false,
            max_concurrent: 4,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_autonomous_mode(mut self, on: bool) -> Self {
        self.autonomous_mode = on;
        self
    }

    pub fn with_max_concurrent(mut self, ceiling: u32) -> Self {
        self.max_concurrent = ceiling.max(1);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Project name cannot be empty".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_floors_ceiling() {
        let p = Project::new("demo", "/tmp/demo", "phase-plan").with_max_concurrent(0);
        assert_eq!(p.max_concurrent, 1);
    }

    #[test]
    fn test_validation() {
        let p = Project::new("", "/tmp/demo", "phase-plan");
        assert!(p.validate().is_err());
    }
}
