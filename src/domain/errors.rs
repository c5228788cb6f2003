//! Domain errors for the foreman orchestration core.

use thiserror::Error;
use uuid::Uuid;

/// Domain-level errors raised by the orchestration core.
///
/// Contention and transient-external errors are recoverable by retrying or
/// picking other work; everything else propagates to the caller. Gate
/// rejection is deliberately NOT an error: it is a normal outcome carried by
/// [`crate::services::phase_engine::GateReport`].
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Project not found: {0}")]
    ProjectNotFound(Uuid),

    #[error("Ticket not found: {0}")]
    TicketNotFound(Uuid),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Join not found: {0}")]
    JoinNotFound(Uuid),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(Uuid),

    #[error("Lock contention on {resource_type} '{resource_id}'")]
    Contention { resource_type: String, resource_id: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Task dependency cycle detected involving task: {0}")]
    DependencyCycle(Uuid),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Concurrency conflict: {entity} {id} was modified")]
    ConcurrencyConflict { entity: String, id: String },

    #[error("Transient external failure in {source_system} after {attempts} attempts: {detail}")]
    TransientExternal { source_system: String, attempts: u32, detail: String },

    #[error("Permanent external failure: {0}")]
    PermanentExternal(String),

    #[error("Corrupt record quarantined: {entity} {id}: {detail}")]
    Corruption { entity: String, id: String, detail: String },

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl DomainError {
    /// Whether the error can be recovered locally by retrying or by the
    /// scheduling loop picking other work.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Contention { .. } | Self::TransientExternal { .. } | Self::ConcurrencyConflict { .. }
        )
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}
