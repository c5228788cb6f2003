//! SQLite implementation of the DiscoveryRepository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Discovery, DiscoveryKind};
use crate::domain::ports::DiscoveryRepository;

#[derive(Clone)]
pub struct SqliteDiscoveryRepository {
    pool: SqlitePool,
}

impl SqliteDiscoveryRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DiscoveryRepository for SqliteDiscoveryRepository {
    async fn create(&self, discovery: &Discovery) -> DomainResult<()> {
        sqlx::query(
            r#"INSERT INTO discoveries (id, source_task_id, kind, description, description_hash,
               target_phase, priority_boost, spawned_task_id, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(discovery.id.to_string())
        .bind(discovery.source_task_id.to_string())
        .bind(discovery.kind.as_str())
        .bind(&discovery.description)
        .bind(&discovery.description_hash)
        .bind(&discovery.target_phase)
        .bind(i32::from(discovery.priority_boost))
        .bind(discovery.spawned_task_id.to_string())
        .bind(discovery.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Discovery>> {
        let row: Option<DiscoveryRow> = sqlx::query_as("SELECT * FROM discoveries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn list_by_source(&self, source_task_id: Uuid) -> DomainResult<Vec<Discovery>> {
        let rows: Vec<DiscoveryRow> =
            sqlx::query_as("SELECT * FROM discoveries WHERE source_task_id = ? ORDER BY created_at")
                .bind(source_task_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_duplicate(
        &self,
        source_task_id: Uuid,
        kind: DiscoveryKind,
        description_hash: &str,
        since: DateTime<Utc>,
    ) -> DomainResult<Option<Discovery>> {
        let row: Option<DiscoveryRow> = sqlx::query_as(
            r#"SELECT * FROM discoveries
               WHERE source_task_id = ? AND kind = ? AND description_hash = ? AND created_at >= ?
               ORDER BY created_at DESC LIMIT 1"#,
        )
        .bind(source_task_id.to_string())
        .bind(kind.as_str())
        .bind(description_hash)
        .bind(since.to_rfc3339())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }
}

#[derive(sqlx::FromRow)]
struct DiscoveryRow {
    id: String,
    source_task_id: String,
    kind: String,
    description: String,
    description_hash: String,
    target_phase: String,
    priority_boost: i32,
    spawned_task_id: String,
    created_at: String,
}

impl TryFrom<DiscoveryRow> for Discovery {
    type Error = DomainError;

    fn try_from(row: DiscoveryRow) -> Result<Self, Self::Error> {
        let kind = DiscoveryKind::from_str(&row.kind)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid kind: {}", row.kind)))?;

        Ok(Discovery {
            id: super::parse_uuid(&row.id)?,
            source_task_id: super::parse_uuid(&row.source_task_id)?,
            kind,
            description: row.description,
            description_hash: row.description_hash,
            target_phase: row.target_phase,
            priority_boost: row.priority_boost != 0,
            spawned_task_id: super::parse_uuid(&row.spawned_task_id)?,
            created_at: super::parse_datetime(&row.created_at)?,
        })
    }
}
