//! Resource lock domain model.
//!
//! Locks grant leases on files and named resources so parallel tasks do not
//! trample each other. A lock is active within
//! `[acquired_at, released_at | expires_at)`; no two exclusive locks on the
//! same resource may have overlapping active windows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    File,
    Named,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Named => "named",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "file" => Some(Self::File),
            "named" => Some(Self::Named),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Conflicts with any active lock on the resource.
    Exclusive,
    /// Conflicts only with active exclusive locks.
    Shared,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Shared => "shared",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "exclusive" => Some(Self::Exclusive),
            "shared" => Some(Self::Shared),
            _ => None,
        }
    }

    /// Whether a new request in `self` mode conflicts with an active holder
    /// in `held` mode.
    pub fn conflicts_with(&self, held: LockMode) -> bool {
        match self {
            Self::Exclusive => true,
            Self::Shared => held == Self::Exclusive,
        }
    }
}

/// A lease on a resource, owned by a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLock {
    pub id: Uuid,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub task_id: Uuid,
    pub agent_id: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl ResourceLock {
    pub fn new(
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        task_id: Uuid,
        agent_id: impl Into<String>,
        mode: LockMode,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            resource_type,
            resource_id: resource_id.into(),
            task_id,
            agent_id: agent_id.into(),
            mode,
            acquired_at: now,
            expires_at: ttl.map(|t| now + t),
            released_at: None,
        }
    }

    /// Whether the lock is active at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.released_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(exp) => exp > now,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_matrix() {
        assert!(LockMode::Exclusive.conflicts_with(LockMode::Exclusive));
        assert!(LockMode::Exclusive.conflicts_with(LockMode::Shared));
        assert!(LockMode::Shared.conflicts_with(LockMode::Exclusive));
        assert!(!LockMode::Shared.conflicts_with(LockMode::Shared));
    }

    #[test]
    fn test_active_window() {
        let now = Utc::now();
        let mut lock = ResourceLock::new(
            ResourceType::File,
            "svc/x.rs",
            Uuid::new_v4(),
            "agent-1",
            LockMode::Exclusive,
            Some(chrono::Duration::seconds(60)),
        );
        assert!(lock.is_active(now));
        assert!(!lock.is_active(now + chrono::Duration::seconds(120)));

        lock.released_at = Some(now);
        assert!(!lock.is_active(now));
    }
}
