//! SQLite implementation of the SandboxRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Sandbox, SandboxKind, SandboxStatus, SessionTranscript};
use crate::domain::ports::SandboxRepository;

#[derive(Clone)]
pub struct SqliteSandboxRepository {
    pool: SqlitePool,
}

impl SqliteSandboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SandboxRepository for SqliteSandboxRepository {
    async fn create(&self, sandbox: &Sandbox) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO sandboxes (id, task_id, ticket_id, workspace_path, branch, base_branch,
               kind, parent_sandbox_id, status, transcript_key, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(sandbox.id.to_string())
        .bind(sandbox.task_id.to_string())
        .bind(sandbox.ticket_id.to_string())
        .bind(&sandbox.workspace_path)
        .bind(&sandbox.branch)
        .bind(&sandbox.base_branch)
        .bind(sandbox.kind.as_str())
        .bind(sandbox.parent_sandbox_id.map(|id| id.to_string()))
        .bind(sandbox.status.as_str())
        .bind(&sandbox.transcript_key)
        .bind(sandbox.created_at.to_rfc3339())
        .bind(sandbox.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Sandbox>> {
        let row: Option<SandboxRow> = sqlx::query_as("SELECT * FROM sandboxes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_task(&self, task_id: Uuid) -> DomainResult<Option<Sandbox>> {
        let row: Option<SandboxRow> =
            sqlx::query_as("SELECT * FROM sandboxes WHERE task_id = ? ORDER BY created_at DESC LIMIT 1")
                .bind(task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn set_status(&self, id: Uuid, status: SandboxStatus) -> DomainResult<()> {
        let outcome = sqlx::query("UPDATE sandboxes SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if outcome.rows_affected() == 0 {
            return Err(DomainError::SandboxNotFound(id));
        }
        Ok(())
    }

    async fn list_active(&self) -> DomainResult<Vec<Sandbox>> {
        let rows: Vec<SandboxRow> =
            sqlx::query_as("SELECT * FROM sandboxes WHERE status != 'terminated' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn save_transcript(&self, transcript: &SessionTranscript) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO session_transcripts (task_id, phase_id, transcript_b64, captured_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (task_id, phase_id) DO UPDATE SET
                   transcript_b64 = excluded.transcript_b64,
                   captured_at = excluded.captured_at"#,
        )
        .bind(transcript.task_id.to_string())
        .bind(&transcript.phase_id)
        .bind(&transcript.transcript_b64)
        .bind(transcript.captured_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_transcript(&self, task_id: Uuid, phase_id: &str) -> DomainResult<Option<SessionTranscript>> {
        let row: Option<TranscriptRow> =
            sqlx::query_as("SELECT * FROM session_transcripts WHERE task_id = ? AND phase_id = ?")
                .bind(task_id.to_string())
                .bind(phase_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct SandboxRow {
    id: String,
    task_id: String,
    ticket_id: String,
    workspace_path: String,
    branch: String,
    base_branch: String,
    kind: String,
    parent_sandbox_id: Option<String>,
    status: String,
    transcript_key: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SandboxRow> for Sandbox {
    type Error = DomainError;

    fn try_from(row: SandboxRow) -> Result<Self, Self::Error> {
        let kind = SandboxKind::from_str(&row.kind)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid kind: {}", row.kind)))?;
        let status = SandboxStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        Ok(Sandbox {
            id: super::parse_uuid(&row.id)?,
            task_id: super::parse_uuid(&row.task_id)?,
            ticket_id: super::parse_uuid(&row.ticket_id)?,
            workspace_path: row.workspace_path,
            branch: row.branch,
            base_branch: row.base_branch,
            kind,
            parent_sandbox_id: super::parse_optional_uuid(row.parent_sandbox_id)?,
            status,
            transcript_key: row.transcript_key,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TranscriptRow {
    task_id: String,
    phase_id: String,
    transcript_b64: String,
    captured_at: String,
}

impl TryFrom<TranscriptRow> for SessionTranscript {
    type Error = DomainError;

    fn try_from(row: TranscriptRow) -> Result<Self, Self::Error> {
        Ok(SessionTranscript {
            task_id: super::parse_uuid(&row.task_id)?,
            phase_id: row.phase_id,
            transcript_b64: row.transcript_b64,
            captured_at: super::parse_datetime(&row.captured_at)?,
        })
    }
}
