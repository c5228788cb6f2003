//! Discovery domain model.
//!
//! A discovery is an agent-reported finding that spawns follow-up work
//! outside the normal phase flow. Records are created once and never
//! mutated; every discovery is paired with a spawned child task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// What kind of finding the agent reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    Bug,
    Optimization,
    Clarification,
    Integration,
    TechDebt,
    Security,
    Performance,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bug => "bug",
            Self::Optimization => "optimization",
            Self::Clarification => "clarification",
            Self::Integration => "integration",
            Self::TechDebt => "tech_debt",
            Self::Security => "security",
            Self::Performance => "performance",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bug" => Some(Self::Bug),
            "optimization" => Some(Self::Optimization),
            "clarification" => Some(Self::Clarification),
            "integration" => Some(Self::Integration),
            "tech_debt" | "tech-debt" => Some(Self::TechDebt),
            "security" => Some(Self::Security),
            "performance" => Some(Self::Performance),
            _ => None,
        }
    }
}

/// An immutable agent-recorded finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub id: Uuid,
    pub source_task_id: Uuid,
    pub kind: DiscoveryKind,
    pub description: String,
    /// SHA-256 of the normalized description, for short-window dedup.
    pub description_hash: String,
    /// Phase the spawned follow-up enters, regardless of `allowed_next`.
    pub target_phase: String,
    /// Raises the spawned task's priority one level.
    pub priority_boost: bool,
    pub spawned_task_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Discovery {
    pub fn new(
        source_task_id: Uuid,
        kind: DiscoveryKind,
        description: impl Into<String>,
        target_phase: impl Into<String>,
        priority_boost: bool,
        spawned_task_id: Uuid,
    ) -> Self {
        let description = description.into();
        let description_hash = hash_description(&description);
        Self {
            id: Uuid::new_v4(),
            source_task_id,
            kind,
            description,
            description_hash,
            target_phase: target_phase.into(),
            priority_boost,
            spawned_task_id,
            created_at: Utc::now(),
        }
    }
}

/// Hash a discovery description for dedup: lowercased, whitespace collapsed.
pub fn hash_description(description: &str) -> String {
    let normalized = description.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    format!("{digest:x}")
}
