//! Event envelope and the closed payload sum.
//!
//! Every message on the bus is an [`Event`]: a payload variant tagged with
//! its channel name, a unique id (consumers dedup on it), and a sequence
//! number assigned at publish time. Channels are named `events.<type>` and
//! preserve publisher FIFO; there is no cross-channel ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::{DiscoveryKind, Priority, TransitionReason};

/// Unique identifier for an event. Consumers must be idempotent on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing sequence number assigned by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn zero() -> Self {
        Self(0)
    }
}

impl std::fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Steering intervention kinds the guardian can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringKind {
    Prioritize,
    Stop,
    Refocus,
    Constraint,
}

impl SteeringKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prioritize => "prioritize",
            Self::Stop => "stop",
            Self::Refocus => "refocus",
            Self::Constraint => "constraint",
        }
    }
}

/// The closed sum of every payload the core publishes or consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: Uuid,
        ticket_id: Uuid,
        phase_id: String,
        priority: Priority,
        dependencies: Vec<Uuid>,
    },

    #[serde(rename = "task.started")]
    TaskStarted {
        task_id: Uuid,
        sandbox_id: Uuid,
        agent_id: String,
    },

    #[serde(rename = "task.completed")]
    TaskCompleted {
        task_id: Uuid,
        result: serde_json::Value,
    },

    #[serde(rename = "task.failed")]
    TaskFailed {
        task_id: Uuid,
        reason: String,
    },

    #[serde(rename = "task.cancelled")]
    TaskCancelled {
        task_id: Uuid,
    },

    #[serde(rename = "tasks.unblocked")]
    TasksUnblocked {
        completed_task_id: Uuid,
        unblocked_ids: Vec<Uuid>,
    },

    #[serde(rename = "phase.transitioned")]
    PhaseTransitioned {
        ticket_id: Uuid,
        from: String,
        to: String,
        reason: TransitionReason,
    },

    #[serde(rename = "phase.gate.rejected")]
    PhaseGateRejected {
        ticket_id: Uuid,
        failing_criteria: Vec<String>,
    },

    #[serde(rename = "phase.approval.requested")]
    PhaseApprovalRequested {
        ticket_id: Uuid,
        to_phase: String,
    },

    #[serde(rename = "phase.approval.granted")]
    PhaseApprovalGranted {
        ticket_id: Uuid,
        to_phase: String,
        actor: String,
    },

    #[serde(rename = "phase.approval.denied")]
    PhaseApprovalDenied {
        ticket_id: Uuid,
        to_phase: String,
        actor: String,
    },

    #[serde(rename = "discovery.recorded")]
    DiscoveryRecorded {
        discovery_id: Uuid,
        source_task_id: Uuid,
        kind: DiscoveryKind,
    },

    #[serde(rename = "coordination.synthesis.completed")]
    SynthesisCompleted {
        continuation_task_id: Uuid,
        source_task_ids: Vec<Uuid>,
        ticket_id: Uuid,
    },

    #[serde(rename = "coordination.synthesis.failed")]
    SynthesisFailed {
        continuation_task_id: Uuid,
        ticket_id: Uuid,
        reason: String,
    },

    #[serde(rename = "merge.succeeded")]
    MergeSucceeded {
        continuation_task_id: Uuid,
        detail: String,
    },

    #[serde(rename = "merge.failed")]
    MergeFailed {
        continuation_task_id: Uuid,
        detail: String,
    },

    #[serde(rename = "sandbox.spawned")]
    SandboxSpawned {
        sandbox_id: Uuid,
        task_id: Uuid,
        workspace_path: String,
    },

    #[serde(rename = "sandbox.terminated")]
    SandboxTerminated {
        sandbox_id: Uuid,
        task_id: Uuid,
    },

    #[serde(rename = "agent.heartbeat")]
    AgentHeartbeat {
        agent_id: String,
        sandbox_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
        /// How many concurrent tasks the agent can take.
        capacity: u32,
        /// Recent tool/action labels, fed to alignment scoring.
        #[serde(default)]
        recent_actions: Vec<String>,
    },

    #[serde(rename = "agent.stuck")]
    AgentStuck {
        agent_id: String,
        task_id: Uuid,
    },

    #[serde(rename = "steering.issued")]
    SteeringIssued {
        agent_id: String,
        kind: SteeringKind,
        message: String,
    },

    /// Raised when a corrupt record is quarantined; operators must act.
    #[serde(rename = "operator.alert")]
    OperatorAlert {
        entity: String,
        entity_id: String,
        detail: String,
    },
}

impl EventPayload {
    /// The `<type>` part of the channel name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task.created",
            Self::TaskStarted { .. } => "task.started",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::TaskCancelled { .. } => "task.cancelled",
            Self::TasksUnblocked { .. } => "tasks.unblocked",
            Self::PhaseTransitioned { .. } => "phase.transitioned",
            Self::PhaseGateRejected { .. } => "phase.gate.rejected",
            Self::PhaseApprovalRequested { .. } => "phase.approval.requested",
            Self::PhaseApprovalGranted { .. } => "phase.approval.granted",
            Self::PhaseApprovalDenied { .. } => "phase.approval.denied",
            Self::DiscoveryRecorded { .. } => "discovery.recorded",
            Self::SynthesisCompleted { .. } => "coordination.synthesis.completed",
            Self::SynthesisFailed { .. } => "coordination.synthesis.failed",
            Self::MergeSucceeded { .. } => "merge.succeeded",
            Self::MergeFailed { .. } => "merge.failed",
            Self::SandboxSpawned { .. } => "sandbox.spawned",
            Self::SandboxTerminated { .. } => "sandbox.terminated",
            Self::AgentHeartbeat { .. } => "agent.heartbeat",
            Self::AgentStuck { .. } => "agent.stuck",
            Self::SteeringIssued { .. } => "steering.issued",
            Self::OperatorAlert { .. } => "operator.alert",
        }
    }

    /// Full channel name: `events.<type>`.
    pub fn channel(&self) -> String {
        format!("events.{}", self.type_name())
    }

    /// Primary entity reference, for indexing and display.
    pub fn entity_ref(&self) -> (Option<&'static str>, Option<String>) {
        match self {
            Self::TaskCreated { task_id, .. }
            | Self::TaskStarted { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskCancelled { task_id }
            | Self::AgentStuck { task_id, .. } => (Some("task"), Some(task_id.to_string())),
            Self::TasksUnblocked { completed_task_id, .. } => {
                (Some("task"), Some(completed_task_id.to_string()))
            }
            Self::SynthesisCompleted { continuation_task_id, .. }
            | Self::SynthesisFailed { continuation_task_id, .. }
            | Self::MergeSucceeded { continuation_task_id, .. }
            | Self::MergeFailed { continuation_task_id, .. } => {
                (Some("task"), Some(continuation_task_id.to_string()))
            }
            Self::PhaseTransitioned { ticket_id, .. }
            | Self::PhaseGateRejected { ticket_id, .. }
            | Self::PhaseApprovalRequested { ticket_id, .. }
            | Self::PhaseApprovalGranted { ticket_id, .. }
            | Self::PhaseApprovalDenied { ticket_id, .. } => {
                (Some("ticket"), Some(ticket_id.to_string()))
            }
            Self::DiscoveryRecorded { discovery_id, .. } => {
                (Some("discovery"), Some(discovery_id.to_string()))
            }
            Self::SandboxSpawned { sandbox_id, .. } | Self::SandboxTerminated { sandbox_id, .. } => {
                (Some("sandbox"), Some(sandbox_id.to_string()))
            }
            Self::AgentHeartbeat { agent_id, .. } | Self::SteeringIssued { agent_id, .. } => {
                (Some("agent"), Some(agent_id.clone()))
            }
            Self::OperatorAlert { entity_id, .. } => (Some("record"), Some(entity_id.clone())),
        }
    }
}

/// Envelope carried on the bus and in the store. Append-only, globally
/// ordered per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub sequence: SequenceNumber,
    pub published_at: DateTime<Utc>,
    /// Identifies the bus instance that published the event, for
    /// cross-process dedup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_process_id: Option<Uuid>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            sequence: SequenceNumber::zero(), // Assigned by the bus
            published_at: Utc::now(),
            source_process_id: None, // Stamped by the bus
            payload,
        }
    }

    pub fn channel(&self) -> String {
        self.payload.channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_names() {
        let e = Event::new(EventPayload::TaskCancelled { task_id: Uuid::new_v4() });
        assert_eq!(e.channel(), "events.task.cancelled");

        let e = Event::new(EventPayload::SynthesisCompleted {
            continuation_task_id: Uuid::new_v4(),
            source_task_ids: vec![],
            ticket_id: Uuid::new_v4(),
        });
        assert_eq!(e.channel(), "events.coordination.synthesis.completed");
    }

    #[test]
    fn test_payload_serde_round_trip() {
        let payload = EventPayload::PhaseTransitioned {
            ticket_id: Uuid::new_v4(),
            from: "phase-design".to_string(),
            to: "phase-implementation".to_string(),
            reason: TransitionReason::Normal,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"phase.transitioned\""));
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_entity_ref() {
        let id = Uuid::new_v4();
        let (kind, entity) = EventPayload::TaskCancelled { task_id: id }.entity_ref();
        assert_eq!(kind, Some("task"));
        assert_eq!(entity, Some(id.to_string()));
    }
}
