//! SQLite implementation of the ProjectRepository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::Project;
use crate::domain::ports::ProjectRepository;

#[derive(Clone)]
pub struct SqliteProjectRepository {
    pool: SqlitePool,
}

impl SqliteProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepository for SqliteProjectRepository {
    async fn create(&self, project: &Project) -> DomainResult<()> {
        project.validate().map_err(DomainError::ValidationFailed)?;

        sqlx::query(
            r#"INSERT INTO projects (id, name, repo_path, default_phase_id, autonomous_mode,
               max_concurrent, archived, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(project.id.to_string())
        .bind(&project.name)
        .bind(&project.repo_path)
        .bind(&project.default_phase_id)
        .bind(i32::from(project.autonomous_mode))
        .bind(project.max_concurrent as i64)
        .bind(i32::from(project.archived))
        .bind(project.created_at.to_rfc3339())
        .bind(project.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as("SELECT * FROM projects WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update(&self, project: &Project) -> DomainResult<()> {
        let outcome = sqlx::query(
            r#"UPDATE projects SET name = ?, repo_path = ?, default_phase_id = ?,
               autonomous_mode = ?, max_concurrent = ?, archived = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(&project.name)
        .bind(&project.repo_path)
        .bind(&project.default_phase_id)
        .bind(i32::from(project.autonomous_mode))
        .bind(project.max_concurrent as i64)
        .bind(i32::from(project.archived))
        .bind(Utc::now().to_rfc3339())
        .bind(project.id.to_string())
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            return Err(DomainError::ProjectNotFound(project.id));
        }
        Ok(())
    }

    async fn list(&self, include_archived: bool) -> DomainResult<Vec<Project>> {
        let query = if include_archived {
            "SELECT * FROM projects ORDER BY created_at"
        } else {
            "SELECT * FROM projects WHERE archived = 0 ORDER BY created_at"
        };
        let rows: Vec<ProjectRow> = sqlx::query_as(query).fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn archive(&self, id: Uuid) -> DomainResult<()> {
        let outcome = sqlx::query("UPDATE projects SET archived = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if outcome.rows_affected() == 0 {
            return Err(DomainError::ProjectNotFound(id));
        }
        Ok(())
    }

    async fn set_autonomous_mode(&self, id: Uuid, on: bool) -> DomainResult<()> {
        let outcome = sqlx::query("UPDATE projects SET autonomous_mode = ?, updated_at = ? WHERE id = ?")
            .bind(i32::from(on))
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if outcome.rows_affected() == 0 {
            return Err(DomainError::ProjectNotFound(id));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    id: String,
    name: String,
    repo_path: String,
    default_phase_id: String,
    autonomous_mode: i32,
    max_concurrent: i64,
    archived: i32,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ProjectRow> for Project {
    type Error = DomainError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        Ok(Project {
            id: super::parse_uuid(&row.id)?,
            name: row.name,
            repo_path: row.repo_path,
            default_phase_id: row.default_phase_id,
            autonomous_mode: row.autonomous_mode != 0,
            max_concurrent: row.max_concurrent as u32,
            archived: row.archived != 0,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
        })
    }
}
