//! Ticket repository port, including phase history and gate evidence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{GateEvidence, PhaseHistoryEntry, Ticket, TicketStatus};

#[async_trait]
pub trait TicketRepository: Send + Sync {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>>;

    /// Optimistic write guarded by the version the caller loaded
    /// (`ticket.version - 1`). Version mismatch returns
    /// `ConcurrencyConflict`; reload and re-apply, or abort.
    async fn update(&self, ticket: &Ticket) -> DomainResult<()>;

    async fn list_by_project(&self, project_id: Uuid) -> DomainResult<Vec<Ticket>>;

    async fn list_by_phase(&self, project_id: Uuid, phase_id: &str) -> DomainResult<Vec<Ticket>>;

    async fn list_by_status(&self, status: TicketStatus) -> DomainResult<Vec<Ticket>>;

    /// Append-only transition record.
    async fn append_history(&self, entry: &PhaseHistoryEntry) -> DomainResult<()>;

    /// Most recent history entry for a ticket, if any.
    async fn latest_history(&self, ticket_id: Uuid) -> DomainResult<Option<PhaseHistoryEntry>>;

    async fn list_history(&self, ticket_id: Uuid) -> DomainResult<Vec<PhaseHistoryEntry>>;

    async fn add_evidence(&self, evidence: &GateEvidence) -> DomainResult<()>;

    /// Evidence attached for a ticket's phase, newest first per definition.
    async fn list_evidence(&self, ticket_id: Uuid, phase_id: &str) -> DomainResult<Vec<GateEvidence>>;
}
