//! SQLite implementation of the JoinRepository.

use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    JoinRegistration, JoinStatus, MergeAttempt, MergeAttemptOutcome, MergeStrategy, SyncPoint,
    SyncPointStatus,
};
use crate::domain::ports::JoinRepository;

#[derive(Clone)]
pub struct SqliteJoinRepository {
    pool: SqlitePool,
}

impl SqliteJoinRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn uuids_to_json(set: &BTreeSet<Uuid>) -> Result<String, serde_json::Error> {
    serde_json::to_string(&set.iter().map(ToString::to_string).collect::<Vec<_>>())
}

fn json_to_uuids(s: &str) -> DomainResult<BTreeSet<Uuid>> {
    let strings: Vec<String> =
        serde_json::from_str(s).map_err(|e| DomainError::SerializationError(e.to_string()))?;
    strings
        .iter()
        .map(|s| super::parse_uuid(s))
        .collect::<DomainResult<BTreeSet<Uuid>>>()
}

#[async_trait]
impl JoinRepository for SqliteJoinRepository {
    async fn create(&self, join: &JoinRegistration) -> DomainResult<()> {
        let sources = uuids_to_json(&join.source_task_ids)?;
        let arrived = uuids_to_json(&join.arrived)?;

        sqlx::query(
            r#"INSERT INTO joins (id, ticket_id, source_task_ids, continuation_task_id, strategy,
               required_count, deadline, arrived, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(join.id.to_string())
        .bind(join.ticket_id.to_string())
        .bind(&sources)
        .bind(join.continuation_task_id.to_string())
        .bind(join.strategy.as_str())
        .bind(join.required_count.map(|c| c as i64))
        .bind(join.deadline.map(|d| d.to_rfc3339()))
        .bind(&arrived)
        .bind(join.status.as_str())
        .bind(join.created_at.to_rfc3339())
        .bind(join.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<JoinRegistration>> {
        let row: Option<JoinRow> = sqlx::query_as("SELECT * FROM joins WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn get_by_continuation(&self, continuation_task_id: Uuid) -> DomainResult<Option<JoinRegistration>> {
        let row: Option<JoinRow> =
            sqlx::query_as("SELECT * FROM joins WHERE continuation_task_id = ? ORDER BY created_at DESC LIMIT 1")
                .bind(continuation_task_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn find_waiting_with_source(&self, source_task_id: Uuid) -> DomainResult<Vec<JoinRegistration>> {
        // Source sets are small JSON arrays; a LIKE probe narrows the scan
        // and the decoded set is the authority.
        let pattern = format!("%{source_task_id}%");
        let rows: Vec<JoinRow> =
            sqlx::query_as("SELECT * FROM joins WHERE status = 'waiting' AND source_task_ids LIKE ?")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await?;

        let mut joins = Vec::new();
        for row in rows {
            let join: JoinRegistration = row.try_into()?;
            if join.source_task_ids.contains(&source_task_id) {
                joins.push(join);
            }
        }
        Ok(joins)
    }

    async fn list_waiting(&self) -> DomainResult<Vec<JoinRegistration>> {
        let rows: Vec<JoinRow> =
            sqlx::query_as("SELECT * FROM joins WHERE status = 'waiting' ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn update(&self, join: &JoinRegistration) -> DomainResult<()> {
        let arrived = uuids_to_json(&join.arrived)?;

        // Guarded: merged/failed joins are frozen; waiting and ready rows
        // may still advance.
        let outcome = sqlx::query(
            r#"UPDATE joins SET arrived = ?, status = ?, updated_at = ?
               WHERE id = ? AND status IN ('waiting', 'ready')"#,
        )
        .bind(&arrived)
        .bind(join.status.as_str())
        .bind(join.updated_at.to_rfc3339())
        .bind(join.id.to_string())
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(DomainError::ConcurrencyConflict {
                entity: "join".to_string(),
                id: join.id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_sync_point(&self, sync_point: &SyncPoint) -> DomainResult<()> {
        let sources = uuids_to_json(&sync_point.source_task_ids)?;
        let arrived = uuids_to_json(&sync_point.arrived)?;

        sqlx::query(
            r#"INSERT INTO sync_points (id, name, source_task_ids, required_count, deadline,
               arrived, status, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(sync_point.id.to_string())
        .bind(&sync_point.name)
        .bind(&sources)
        .bind(sync_point.required_count as i64)
        .bind(sync_point.deadline.map(|d| d.to_rfc3339()))
        .bind(&arrived)
        .bind(sync_point.status.as_str())
        .bind(sync_point.created_at.to_rfc3339())
        .bind(sync_point.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_sync_point(&self, name: &str) -> DomainResult<Option<SyncPoint>> {
        let row: Option<SyncPointRow> = sqlx::query_as("SELECT * FROM sync_points WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_sync_point(&self, sync_point: &SyncPoint) -> DomainResult<()> {
        let arrived = uuids_to_json(&sync_point.arrived)?;
        sqlx::query("UPDATE sync_points SET arrived = ?, status = ?, updated_at = ? WHERE id = ?")
            .bind(&arrived)
            .bind(sync_point.status.as_str())
            .bind(sync_point.updated_at.to_rfc3339())
            .bind(sync_point.id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_waiting_sync_points_with_source(&self, source_task_id: Uuid) -> DomainResult<Vec<SyncPoint>> {
        let pattern = format!("%{source_task_id}%");
        let rows: Vec<SyncPointRow> =
            sqlx::query_as("SELECT * FROM sync_points WHERE status = 'waiting' AND source_task_ids LIKE ?")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await?;

        let mut points = Vec::new();
        for row in rows {
            let point: SyncPoint = row.try_into()?;
            if point.source_task_ids.contains(&source_task_id) {
                points.push(point);
            }
        }
        Ok(points)
    }

    async fn append_merge_attempt(&self, attempt: &MergeAttempt) -> DomainResult<()> {
        let conflict_files = serde_json::to_string(&attempt.conflict_files)?;
        sqlx::query(
            r#"INSERT INTO merge_attempts (join_id, source_task_id, ordinal, outcome,
               conflict_files, resolution, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(attempt.join_id.to_string())
        .bind(attempt.source_task_id.to_string())
        .bind(i64::from(attempt.ordinal))
        .bind(attempt.outcome.as_str())
        .bind(&conflict_files)
        .bind(&attempt.resolution)
        .bind(attempt.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_merge_attempts(&self, join_id: Uuid) -> DomainResult<Vec<MergeAttempt>> {
        let rows: Vec<MergeAttemptRow> =
            sqlx::query_as("SELECT * FROM merge_attempts WHERE join_id = ? ORDER BY id")
                .bind(join_id.to_string())
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[derive(sqlx::FromRow)]
struct JoinRow {
    id: String,
    ticket_id: String,
    source_task_ids: String,
    continuation_task_id: String,
    strategy: String,
    required_count: Option<i64>,
    deadline: Option<String>,
    arrived: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<JoinRow> for JoinRegistration {
    type Error = DomainError;

    fn try_from(row: JoinRow) -> Result<Self, Self::Error> {
        let strategy = MergeStrategy::from_str(&row.strategy).ok_or_else(|| {
            DomainError::SerializationError(format!("Invalid strategy: {}", row.strategy))
        })?;
        let status = JoinStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        Ok(JoinRegistration {
            id: super::parse_uuid(&row.id)?,
            ticket_id: super::parse_uuid(&row.ticket_id)?,
            source_task_ids: json_to_uuids(&row.source_task_ids)?,
            continuation_task_id: super::parse_uuid(&row.continuation_task_id)?,
            strategy,
            required_count: row.required_count.map(|c| c as usize),
            deadline: super::parse_optional_datetime(row.deadline)?,
            arrived: json_to_uuids(&row.arrived)?,
            status,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SyncPointRow {
    id: String,
    name: String,
    source_task_ids: String,
    required_count: i64,
    deadline: Option<String>,
    arrived: String,
    status: String,
    created_at: String,
    updated_at: String,
}

impl TryFrom<SyncPointRow> for SyncPoint {
    type Error = DomainError;

    fn try_from(row: SyncPointRow) -> Result<Self, Self::Error> {
        let status = SyncPointStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;

        Ok(SyncPoint {
            id: super::parse_uuid(&row.id)?,
            name: row.name,
            source_task_ids: json_to_uuids(&row.source_task_ids)?,
            required_count: row.required_count as usize,
            deadline: super::parse_optional_datetime(row.deadline)?,
            arrived: json_to_uuids(&row.arrived)?,
            status,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MergeAttemptRow {
    #[allow(dead_code)]
    id: i64,
    join_id: String,
    source_task_id: String,
    ordinal: i64,
    outcome: String,
    conflict_files: Option<String>,
    resolution: Option<String>,
    created_at: String,
}

impl TryFrom<MergeAttemptRow> for MergeAttempt {
    type Error = DomainError;

    fn try_from(row: MergeAttemptRow) -> Result<Self, Self::Error> {
        let outcome = MergeAttemptOutcome::from_str(&row.outcome)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid outcome: {}", row.outcome)))?;

        Ok(MergeAttempt {
            join_id: super::parse_uuid(&row.join_id)?,
            source_task_id: super::parse_uuid(&row.source_task_id)?,
            ordinal: row.ordinal as u32,
            outcome,
            conflict_files: super::parse_json_or_default(row.conflict_files)?,
            resolution: row.resolution,
            created_at: super::parse_datetime(&row.created_at)?,
        })
    }
}
