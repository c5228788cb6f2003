//! Coordination records: join registrations and sync points.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// How source result payloads combine into the continuation context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Shallow-merge maps, concatenate lists; later sources win on key clash.
    Combine,
    /// Set union of list payloads.
    Union,
    /// Set intersection of list payloads.
    Intersection,
    /// Per-value majority vote across sources.
    Majority,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::Combine
    }
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Combine => "combine",
            Self::Union => "union",
            Self::Intersection => "intersection",
            Self::Majority => "majority",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "combine" => Some(Self::Combine),
            "union" => Some(Self::Union),
            "intersection" => Some(Self::Intersection),
            "majority" => Some(Self::Majority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStatus {
    Waiting,
    Ready,
    Merged,
    Failed,
}

impl JoinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Merged => "merged",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "waiting" => Some(Self::Waiting),
            "ready" => Some(Self::Ready),
            "merged" => Some(Self::Merged),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Links a set of source tasks to the continuation task that synthesizes
/// their results.
///
/// Invariant: `source_task_ids` ⊆ the continuation task's dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRegistration {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub source_task_ids: BTreeSet<Uuid>,
    pub continuation_task_id: Uuid,
    pub strategy: MergeStrategy,
    /// Sources needed for early readiness. `None` means all of them.
    pub required_count: Option<usize>,
    pub deadline: Option<DateTime<Utc>>,
    /// Sources that have completed so far. Persisted across restarts.
    pub arrived: BTreeSet<Uuid>,
    pub status: JoinStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JoinRegistration {
    pub fn new(
        ticket_id: Uuid,
        source_task_ids: impl IntoIterator<Item = Uuid>,
        continuation_task_id: Uuid,
        strategy: MergeStrategy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            source_task_ids: source_task_ids.into_iter().collect(),
            continuation_task_id,
            strategy,
            required_count: None,
            deadline: None,
            arrived: BTreeSet::new(),
            status: JoinStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_required_count(mut self, count: usize) -> Self {
        self.required_count = Some(count);
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Number of arrivals needed before the join fires.
    pub fn threshold(&self) -> usize {
        self.required_count
            .map_or(self.source_task_ids.len(), |c| c.min(self.source_task_ids.len()))
    }

    /// Whether enough sources have arrived.
    pub fn is_satisfied(&self) -> bool {
        self.arrived.len() >= self.threshold()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPointStatus {
    Waiting,
    Ready,
    TimedOut,
}

impl SyncPointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::TimedOut => "timed_out",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "waiting" => Some(Self::Waiting),
            "ready" => Some(Self::Ready),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// A named gate that becomes ready when enough sources complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub id: Uuid,
    pub name: String,
    pub source_task_ids: BTreeSet<Uuid>,
    pub required_count: usize,
    pub deadline: Option<DateTime<Utc>>,
    pub arrived: BTreeSet<Uuid>,
    pub status: SyncPointStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncPoint {
    pub fn new(
        name: impl Into<String>,
        source_task_ids: impl IntoIterator<Item = Uuid>,
        required_count: usize,
        deadline: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        let sources: BTreeSet<Uuid> = source_task_ids.into_iter().collect();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            required_count: required_count.min(sources.len()),
            source_task_ids: sources,
            deadline,
            arrived: BTreeSet::new(),
            status: SyncPointStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.arrived.len() >= self.required_count
    }
}

/// A single attempt at merging one source branch during convergence.
/// Rows are append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeAttempt {
    pub join_id: Uuid,
    pub source_task_id: Uuid,
    pub ordinal: u32,
    pub outcome: MergeAttemptOutcome,
    pub conflict_files: Vec<String>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAttemptOutcome {
    Clean,
    Resolved,
    Conflict,
}

impl MergeAttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Resolved => "resolved",
            Self::Conflict => "conflict",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "clean" => Some(Self::Clean),
            "resolved" => Some(Self::Resolved),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_defaults_to_all_sources() {
        let sources = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let join = JoinRegistration::new(Uuid::new_v4(), sources.clone(), Uuid::new_v4(), MergeStrategy::Combine);
        assert_eq!(join.threshold(), 3);

        let early = JoinRegistration::new(Uuid::new_v4(), sources, Uuid::new_v4(), MergeStrategy::Combine)
            .with_required_count(2);
        assert_eq!(early.threshold(), 2);
    }

    #[test]
    fn test_required_count_capped_at_source_count() {
        let sources = vec![Uuid::new_v4(), Uuid::new_v4()];
        let join = JoinRegistration::new(Uuid::new_v4(), sources, Uuid::new_v4(), MergeStrategy::Union)
            .with_required_count(10);
        assert_eq!(join.threshold(), 2);
    }

    #[test]
    fn test_satisfaction() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut join =
            JoinRegistration::new(Uuid::new_v4(), vec![a, b], Uuid::new_v4(), MergeStrategy::Combine);
        assert!(!join.is_satisfied());
        join.arrived.insert(a);
        assert!(!join.is_satisfied());
        join.arrived.insert(b);
        assert!(join.is_satisfied());
    }

    #[test]
    fn test_sync_point_caps_required_count() {
        let sp = SyncPoint::new("gate", vec![Uuid::new_v4()], 5, None);
        assert_eq!(sp.required_count, 1);
    }
}
