//! Domain models for the foreman orchestration core.

pub mod dag;
pub mod discovery;
pub mod join;
pub mod lock;
pub mod phase;
pub mod project;
pub mod sandbox;
pub mod task;
pub mod ticket;

pub use dag::{DagError, TaskDag};
pub use discovery::{hash_description, Discovery, DiscoveryKind};
pub use join::{
    JoinRegistration, JoinStatus, MergeAttempt, MergeAttemptOutcome, MergeStrategy, SyncPoint,
    SyncPointStatus,
};
pub use lock::{LockMode, ResourceLock, ResourceType};
pub use phase::{
    default_phases, ExpectedOutput, GateEvidence, PhaseConfig, PhaseDef, PhaseHistoryEntry,
    TransitionReason, PHASE_ID_PREFIX,
};
pub use project::Project;
pub use sandbox::{Sandbox, SandboxKind, SandboxStatus, SessionTranscript, PLANNING_DIRS};
pub use task::{Priority, Task, TaskStatus, TaskType};
pub use ticket::{Ticket, TicketStatus};
