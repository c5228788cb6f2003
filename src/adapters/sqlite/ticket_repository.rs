//! SQLite implementation of the TicketRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    GateEvidence, PhaseHistoryEntry, Priority, Ticket, TicketStatus, TransitionReason,
};
use crate::domain::ports::TicketRepository;

#[derive(Clone)]
pub struct SqliteTicketRepository {
    pool: SqlitePool,
}

impl SqliteTicketRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TicketRepository for SqliteTicketRepository {
    async fn create(&self, ticket: &Ticket) -> DomainResult<()> {
        ticket.validate().map_err(DomainError::ValidationFailed)?;

        let blocked_by = serde_json::to_string(&ticket.blocked_by)?;
        let synthesis = ticket.synthesis_context.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"INSERT INTO tickets (id, project_id, title, description, current_phase, status,
               priority, blocked_by, spec_id, synthesis_context, version, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(ticket.id.to_string())
        .bind(ticket.project_id.to_string())
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(&ticket.current_phase)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(&blocked_by)
        .bind(ticket.spec_id.map(|id| id.to_string()))
        .bind(&synthesis)
        .bind(ticket.version as i64)
        .bind(ticket.created_at.to_rfc3339())
        .bind(ticket.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Ticket>> {
        let row: Option<TicketRow> = sqlx::query_as("SELECT * FROM tickets WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, ticket: &Ticket) -> DomainResult<()> {
        let blocked_by = serde_json::to_string(&ticket.blocked_by)?;
        let synthesis = ticket.synthesis_context.as_ref().map(serde_json::to_string).transpose()?;

        // Optimistic concurrency: the guard version is the one the caller
        // loaded, i.e. the in-memory version minus the touch() increment.
        let outcome = sqlx::query(
            r#"UPDATE tickets SET title = ?, description = ?, current_phase = ?, status = ?,
               priority = ?, blocked_by = ?, spec_id = ?, synthesis_context = ?,
               version = ?, updated_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(&ticket.title)
        .bind(&ticket.description)
        .bind(&ticket.current_phase)
        .bind(ticket.status.as_str())
        .bind(ticket.priority.as_str())
        .bind(&blocked_by)
        .bind(ticket.spec_id.map(|id| id.to_string()))
        .bind(&synthesis)
        .bind(ticket.version as i64)
        .bind(ticket.updated_at.to_rfc3339())
        .bind(ticket.id.to_string())
        .bind((ticket.version as i64) - 1)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tickets WHERE id = ?")
                .bind(ticket.id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return match exists {
                Some(_) => Err(DomainError::ConcurrencyConflict {
                    entity: "ticket".to_string(),
                    id: ticket.id.to_string(),
                }),
                None => Err(DomainError::TicketNotFound(ticket.id)),
            };
        }

        Ok(())
    }

    async fn list_by_project(&self, project_id: Uuid) -> DomainResult<Vec<Ticket>> {
        let rows: Vec<TicketRow> =
            sqlx::query_as("SELECT * FROM tickets WHERE project_id = ? ORDER BY created_at DESC")
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_phase(&self, project_id: Uuid, phase_id: &str) -> DomainResult<Vec<Ticket>> {
        let rows: Vec<TicketRow> = sqlx::query_as(
            "SELECT * FROM tickets WHERE project_id = ? AND current_phase = ? ORDER BY created_at",
        )
        .bind(project_id.to_string())
        .bind(phase_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_status(&self, status: TicketStatus) -> DomainResult<Vec<Ticket>> {
        let rows: Vec<TicketRow> =
            sqlx::query_as("SELECT * FROM tickets WHERE status = ? ORDER BY created_at")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn append_history(&self, entry: &PhaseHistoryEntry) -> DomainResult<()> {
        let artifacts = serde_json::to_string(&entry.artifacts)?;
        sqlx::query(
            r#"INSERT INTO phase_history (ticket_id, from_phase, to_phase, reason, actor_id, artifacts, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(entry.ticket_id.to_string())
        .bind(&entry.from_phase)
        .bind(&entry.to_phase)
        .bind(entry.reason.as_str())
        .bind(&entry.actor_id)
        .bind(&artifacts)
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_history(&self, ticket_id: Uuid) -> DomainResult<Option<PhaseHistoryEntry>> {
        let row: Option<HistoryRow> = sqlx::query_as(
            "SELECT * FROM phase_history WHERE ticket_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(ticket_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_history(&self, ticket_id: Uuid) -> DomainResult<Vec<PhaseHistoryEntry>> {
        let rows: Vec<HistoryRow> =
            sqlx::query_as("SELECT * FROM phase_history WHERE ticket_id = ? ORDER BY id")
                .bind(ticket_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn add_evidence(&self, evidence: &GateEvidence) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO gate_evidence (ticket_id, phase_id, definition, satisfied, evidence_ref, recorded_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(evidence.ticket_id.to_string())
        .bind(&evidence.phase_id)
        .bind(&evidence.definition)
        .bind(i32::from(evidence.satisfied))
        .bind(&evidence.evidence_ref)
        .bind(evidence.recorded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_evidence(&self, ticket_id: Uuid, phase_id: &str) -> DomainResult<Vec<GateEvidence>> {
        let rows: Vec<EvidenceRow> = sqlx::query_as(
            "SELECT * FROM gate_evidence WHERE ticket_id = ? AND phase_id = ? ORDER BY id DESC",
        )
        .bind(ticket_id.to_string())
        .bind(phase_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: String,
    project_id: String,
    title: String,
    description: Option<String>,
    current_phase: String,
    status: String,
    priority: String,
    blocked_by: Option<String>,
    spec_id: Option<String>,
    synthesis_context: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<TicketRow> for Ticket {
    type Error = DomainError;

    fn try_from(row: TicketRow) -> Result<Self, Self::Error> {
        let status = TicketStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let priority = Priority::from_str(&row.priority)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid priority: {}", row.priority)))?;

        Ok(Ticket {
            id: super::parse_uuid(&row.id)?,
            project_id: super::parse_uuid(&row.project_id)?,
            title: row.title,
            description: row.description.unwrap_or_default(),
            current_phase: row.current_phase,
            status,
            priority,
            blocked_by: super::parse_json_or_default(row.blocked_by)?,
            spec_id: super::parse_optional_uuid(row.spec_id)?,
            synthesis_context: super::parse_optional_json(row.synthesis_context)?,
            version: row.version as u64,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    #[allow(dead_code)]
    id: i64,
    ticket_id: String,
    from_phase: String,
    to_phase: String,
    reason: String,
    actor_id: String,
    artifacts: Option<String>,
    created_at: String,
}

impl TryFrom<HistoryRow> for PhaseHistoryEntry {
    type Error = DomainError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        let reason = TransitionReason::from_str(&row.reason)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid reason: {}", row.reason)))?;
        Ok(PhaseHistoryEntry {
            ticket_id: super::parse_uuid(&row.ticket_id)?,
            from_phase: row.from_phase,
            to_phase: row.to_phase,
            reason,
            actor_id: row.actor_id,
            artifacts: super::parse_json_or_default(row.artifacts)?,
            created_at: super::parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EvidenceRow {
    #[allow(dead_code)]
    id: i64,
    ticket_id: String,
    phase_id: String,
    definition: String,
    satisfied: i32,
    evidence_ref: Option<String>,
    recorded_at: String,
}

impl TryFrom<EvidenceRow> for GateEvidence {
    type Error = DomainError;

    fn try_from(row: EvidenceRow) -> Result<Self, Self::Error> {
        Ok(GateEvidence {
            ticket_id: super::parse_uuid(&row.ticket_id)?,
            phase_id: row.phase_id,
            definition: row.definition,
            satisfied: row.satisfied != 0,
            evidence_ref: row.evidence_ref,
            recorded_at: super::parse_datetime(&row.recorded_at)?,
        })
    }
}
