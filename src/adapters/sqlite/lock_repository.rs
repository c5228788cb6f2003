//! SQLite implementation of the LockRepository.
//!
//! `try_acquire` runs the conflict probe and the insert inside a single
//! transaction, so concurrent acquirers serialize on the database writer
//! lock and exactly one of them wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{LockMode, ResourceLock, ResourceType};
use crate::domain::ports::LockRepository;

#[derive(Clone)]
pub struct SqliteLockRepository {
    pool: SqlitePool,
}

impl SqliteLockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockRepository for SqliteLockRepository {
    async fn try_acquire(&self, lock: &ResourceLock) -> DomainResult<ResourceLock> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        // An exclusive request conflicts with any active lock; a shared
        // request conflicts only with active exclusive locks.
        let conflict_filter = match lock.mode {
            LockMode::Exclusive => "",
            LockMode::Shared => " AND mode = 'exclusive'",
        };
        let probe = format!(
            r#"SELECT COUNT(*) FROM resource_locks
               WHERE resource_type = ? AND resource_id = ?
                 AND released_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?){conflict_filter}"#,
        );

        let (conflicts,): (i64,) = sqlx::query_as(&probe)
            .bind(lock.resource_type.as_str())
            .bind(&lock.resource_id)
            .bind(&now)
            .fetch_one(&mut *tx)
            .await?;

        if conflicts > 0 {
            tx.rollback().await?;
            return Err(DomainError::Contention {
                resource_type: lock.resource_type.as_str().to_string(),
                resource_id: lock.resource_id.clone(),
            });
        }

        sqlx::query(
            r#"INSERT INTO resource_locks (id, resource_type, resource_id, task_id, agent_id,
               mode, acquired_at, expires_at, released_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)"#,
        )
        .bind(lock.id.to_string())
        .bind(lock.resource_type.as_str())
        .bind(&lock.resource_id)
        .bind(lock.task_id.to_string())
        .bind(&lock.agent_id)
        .bind(lock.mode.as_str())
        .bind(lock.acquired_at.to_rfc3339())
        .bind(lock.expires_at.map(|t| t.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(lock.clone())
    }

    async fn release(&self, lock_id: Uuid) -> DomainResult<()> {
        // Idempotent: only the first release sets released_at.
        sqlx::query("UPDATE resource_locks SET released_at = ? WHERE id = ? AND released_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(lock_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release_by_task(&self, task_id: Uuid) -> DomainResult<u64> {
        let outcome = sqlx::query(
            "UPDATE resource_locks SET released_at = ? WHERE task_id = ? AND released_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let outcome = sqlx::query(
            r#"UPDATE resource_locks SET released_at = ?
               WHERE released_at IS NULL AND expires_at IS NOT NULL AND expires_at < ?"#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected())
    }

    async fn list_active(&self) -> DomainResult<Vec<ResourceLock>> {
        let now = Utc::now().to_rfc3339();
        let rows: Vec<LockRow> = sqlx::query_as(
            r#"SELECT * FROM resource_locks
               WHERE released_at IS NULL AND (expires_at IS NULL OR expires_at > ?)
               ORDER BY acquired_at"#,
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_by_task(&self, task_id: Uuid) -> DomainResult<Vec<ResourceLock>> {
        let rows: Vec<LockRow> =
            sqlx::query_as("SELECT * FROM resource_locks WHERE task_id = ? ORDER BY acquired_at")
                .bind(task_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn has_conflict(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        mode: LockMode,
        exclude_task: Option<Uuid>,
    ) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let mut query = String::from(
            r#"SELECT COUNT(*) FROM resource_locks
               WHERE resource_type = ? AND resource_id = ?
                 AND released_at IS NULL
                 AND (expires_at IS NULL OR expires_at > ?)"#,
        );
        if mode == LockMode::Shared {
            query.push_str(" AND mode = 'exclusive'");
        }
        if exclude_task.is_some() {
            query.push_str(" AND task_id != ?");
        }

        let mut q = sqlx::query_as::<_, (i64,)>(&query)
            .bind(resource_type.as_str())
            .bind(resource_id)
            .bind(&now);
        if let Some(task_id) = exclude_task {
            q = q.bind(task_id.to_string());
        }

        let (count,) = q.fetch_one(&self.pool).await?;
        Ok(count > 0)
    }
}

#[derive(sqlx::FromRow)]
struct LockRow {
    id: String,
    resource_type: String,
    resource_id: String,
    task_id: String,
    agent_id: String,
    mode: String,
    acquired_at: String,
    expires_at: Option<String>,
    released_at: Option<String>,
}

impl TryFrom<LockRow> for ResourceLock {
    type Error = DomainError;

    fn try_from(row: LockRow) -> Result<Self, Self::Error> {
        let resource_type = ResourceType::from_str(&row.resource_type).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid resource_type: {}", row.resource_type))
        })?;
        let mode = LockMode::from_str(&row.mode)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid mode: {}", row.mode)))?;

        Ok(ResourceLock {
            id: super::parse_uuid(&row.id)?,
            resource_type,
            resource_id: row.resource_id,
            task_id: super::parse_uuid(&row.task_id)?,
            agent_id: row.agent_id,
            mode,
            acquired_at: super::parse_datetime(&row.acquired_at)?,
            expires_at: super::parse_optional_datetime(row.expires_at)?,
            released_at: super::parse_optional_datetime(row.released_at)?,
        })
    }
}
