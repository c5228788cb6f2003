//! Phase definitions, transition history, and gate evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix every phase id must carry.
pub const PHASE_ID_PREFIX: &str = "phase-";

/// An expected output artifact of a phase: a glob over the ticket workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedOutput {
    /// Glob pattern relative to the ticket workspace root.
    pub pattern: String,
    /// When true, a missing match fails the gate.
    #[serde(default)]
    pub required: bool,
}

/// Per-phase execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Default task deadline within this phase, in seconds.
    pub timeout_secs: u64,
    /// Per-phase cap on retry attempts.
    pub max_retries: u32,
    /// Base backoff for transient failures, in milliseconds.
    pub retry_backoff_ms: u64,
    /// Work-in-progress limit for tickets in this phase. Zero = unlimited.
    pub wip_limit: u32,
    /// When true, transitions into this phase suspend on human approval.
    #[serde(default)]
    pub requires_approval: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            max_retries: 3,
            retry_backoff_ms: 1_000,
            wip_limit: 0,
            requires_approval: false,
        }
    }
}

/// Definition of a named stage a ticket moves through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    /// Identifier; must start with [`PHASE_ID_PREFIX`]. Scoped per project.
    pub id: String,
    pub name: String,
    /// Ordering within the project; unique per project.
    pub sequence: u32,
    /// Free-form verifiable statements. Satisfaction is delegated to
    /// attached [`GateEvidence`] records.
    pub done_definitions: Vec<String>,
    /// Artifact globs checked against the ticket workspace.
    pub expected_outputs: Vec<ExpectedOutput>,
    /// Prompt handed to agents executing in this phase.
    pub prompt: String,
    /// Phases a normal transition may target. Empty for terminal phases.
    pub allowed_next: Vec<String>,
    pub terminal: bool,
    #[serde(default)]
    pub config: PhaseConfig,
}

impl PhaseDef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, sequence: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            sequence,
            done_definitions: Vec::new(),
            expected_outputs: Vec::new(),
            prompt: String::new(),
            allowed_next: Vec::new(),
            terminal: false,
            config: PhaseConfig::default(),
        }
    }

    pub fn with_allowed_next(mut self, next: Vec<String>) -> Self {
        self.allowed_next = next;
        self
    }

    pub fn with_done_definitions(mut self, defs: Vec<String>) -> Self {
        self.done_definitions = defs;
        self
    }

    pub fn with_expected_outputs(mut self, outputs: Vec<ExpectedOutput>) -> Self {
        self.expected_outputs = outputs;
        self
    }

    pub fn terminal(mut self) -> Self {
        self.terminal = true;
        self.allowed_next.clear();
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.id.starts_with(PHASE_ID_PREFIX) {
            return Err(format!("Phase id '{}' must start with '{}'", self.id, PHASE_ID_PREFIX));
        }
        if self.terminal && !self.allowed_next.is_empty() {
            return Err(format!("Terminal phase '{}' must have empty allowed_next", self.id));
        }
        Ok(())
    }
}

/// Why a phase transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Gate-validated progression along `allowed_next`.
    Normal,
    /// Discovery-driven branch, bypassing `allowed_next`.
    Discovery,
    /// Operator override, bypassing `allowed_next`.
    Manual,
    /// Gate or approval rejection sent the ticket back.
    Rejection,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Discovery => "discovery",
            Self::Manual => "manual",
            Self::Rejection => "rejection",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Some(Self::Normal),
            "discovery" => Some(Self::Discovery),
            "manual" => Some(Self::Manual),
            "rejection" => Some(Self::Rejection),
            _ => None,
        }
    }

    /// Reasons that bypass the `allowed_next` restriction.
    pub fn bypasses_allowed_next(&self) -> bool {
        matches!(self, Self::Discovery | Self::Manual)
    }
}

/// Append-only record of a ticket's phase transition. Never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseHistoryEntry {
    pub ticket_id: Uuid,
    pub from_phase: String,
    pub to_phase: String,
    pub reason: TransitionReason,
    pub actor_id: String,
    pub artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Evidence attached against a done-definition by an agent or validator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateEvidence {
    pub ticket_id: Uuid,
    pub phase_id: String,
    pub definition: String,
    pub satisfied: bool,
    pub evidence_ref: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Built-in phase set installed for new projects.
pub fn default_phases() -> Vec<PhaseDef> {
    vec![
        PhaseDef::new("phase-requirements", "Requirements", 1)
            .with_done_definitions(vec!["Requirements document drafted and reviewed".to_string()])
            .with_expected_outputs(vec![ExpectedOutput {
                pattern: "requirements/*.md".to_string(),
                required: true,
            }])
            .with_allowed_next(vec!["phase-design".to_string()]),
        PhaseDef::new("phase-design", "Design", 2)
            .with_done_definitions(vec!["Design document covers every requirement".to_string()])
            .with_expected_outputs(vec![ExpectedOutput {
                pattern: "designs/*.md".to_string(),
                required: true,
            }])
            .with_allowed_next(vec!["phase-implementation".to_string()]),
        PhaseDef::new("phase-implementation", "Implementation", 3)
            .with_done_definitions(vec!["All planned tasks completed".to_string()])
            .with_allowed_next(vec!["phase-review".to_string()]),
        PhaseDef::new("phase-review", "Review", 4)
            .with_done_definitions(vec!["Pull request approved".to_string()])
            .with_allowed_next(vec!["phase-done".to_string()]),
        PhaseDef::new("phase-done", "Done", 5).terminal(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_id_prefix_enforced() {
        let p = PhaseDef::new("implementation", "Implementation", 1);
        assert!(p.validate().is_err());
        let p = PhaseDef::new("phase-implementation", "Implementation", 1);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_terminal_clears_allowed_next() {
        let p = PhaseDef::new("phase-done", "Done", 9)
            .with_allowed_next(vec!["phase-review".to_string()])
            .terminal();
        assert!(p.allowed_next.is_empty());
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_default_phases_are_valid_and_ordered() {
        let phases = default_phases();
        for p in &phases {
            p.validate().unwrap();
        }
        let mut seqs: Vec<u32> = phases.iter().map(|p| p.sequence).collect();
        let sorted = seqs.clone();
        seqs.dedup();
        assert_eq!(seqs.len(), sorted.len(), "sequences must be unique");
        // Exactly one terminal phase, and it allows nothing next.
        let terminals: Vec<_> = phases.iter().filter(|p| p.terminal).collect();
        assert_eq!(terminals.len(), 1);
        assert!(terminals[0].allowed_next.is_empty());
    }
}
