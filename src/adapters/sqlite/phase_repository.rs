//! SQLite implementation of the PhaseRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{PhaseConfig, PhaseDef};
use crate::domain::ports::PhaseRepository;

#[derive(Clone)]
pub struct SqlitePhaseRepository {
    pool: SqlitePool,
}

impl SqlitePhaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PhaseRepository for SqlitePhaseRepository {
    async fn upsert(&self, project_id: Uuid, phase: &PhaseDef) -> DomainResult<()> {
        phase.validate().map_err(DomainError::ValidationFailed)?;

        let done_definitions = serde_json::to_string(&phase.done_definitions)?;
        let expected_outputs = serde_json::to_string(&phase.expected_outputs)?;
        let allowed_next = serde_json::to_string(&phase.allowed_next)?;
        let config = serde_json::to_string(&phase.config)?;

        sqlx::query(
            r#"INSERT INTO phases (project_id, id, name, sequence, done_definitions,
               expected_outputs, prompt, allowed_next, terminal, config)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (project_id, id) DO UPDATE SET
                   name = excluded.name,
                   sequence = excluded.sequence,
                   done_definitions = excluded.done_definitions,
                   expected_outputs = excluded.expected_outputs,
                   prompt = excluded.prompt,
                   allowed_next = excluded.allowed_next,
                   terminal = excluded.terminal,
                   config = excluded.config"#,
        )
        .bind(project_id.to_string())
        .bind(&phase.id)
        .bind(&phase.name)
        .bind(i64::from(phase.sequence))
        .bind(&done_definitions)
        .bind(&expected_outputs)
        .bind(&phase.prompt)
        .bind(&allowed_next)
        .bind(i32::from(phase.terminal))
        .bind(&config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, project_id: Uuid, phase_id: &str) -> DomainResult<Option<PhaseDef>> {
        let row: Option<PhaseRow> =
            sqlx::query_as("SELECT * FROM phases WHERE project_id = ? AND id = ?")
                .bind(project_id.to_string())
                .bind(phase_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_for_project(&self, project_id: Uuid) -> DomainResult<Vec<PhaseDef>> {
        let rows: Vec<PhaseRow> =
            sqlx::query_as("SELECT * FROM phases WHERE project_id = ? ORDER BY sequence")
                .bind(project_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct PhaseRow {
    #[allow(dead_code)]
    project_id: String,
    id: String,
    name: String,
    sequence: i64,
    done_definitions: Option<String>,
    expected_outputs: Option<String>,
    prompt: Option<String>,
    allowed_next: Option<String>,
    terminal: i32,
    config: Option<String>,
}

impl TryFrom<PhaseRow> for PhaseDef {
    type Error = DomainError;

    fn try_from(row: PhaseRow) -> Result<Self, Self::Error> {
        let config: PhaseConfig = match row.config {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| DomainError::SerializationError(format!("Invalid phase config: {e}")))?,
            None => PhaseConfig::default(),
        };

        Ok(PhaseDef {
            id: row.id,
            name: row.name,
            sequence: row.sequence as u32,
            done_definitions: super::parse_json_or_default(row.done_definitions)?,
            expected_outputs: super::parse_json_or_default(row.expected_outputs)?,
            prompt: row.prompt.unwrap_or_default(),
            allowed_next: super::parse_json_or_default(row.allowed_next)?,
            terminal: row.terminal != 0,
            config,
        })
    }
}
