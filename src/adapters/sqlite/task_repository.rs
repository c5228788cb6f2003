//! SQLite implementation of the TaskRepository.
//!
//! Claim and completion paths are single guarded statements: two concurrent
//! orchestrator instances can never double-assign or double-complete a task.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{Priority, Task, TaskStatus, TaskType};
use crate::domain::ports::{ClaimFilter, TaskFilter, TaskRepository};

#[derive(Clone)]
pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_dependencies(&self, task: &mut Task) -> DomainResult<()> {
        let deps: Vec<(String,)> = sqlx::query_as("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?")
            .bind(task.id.to_string())
            .fetch_all(&self.pool)
            .await?;

        task.depends_on = deps.into_iter().filter_map(|(id,)| Uuid::parse_str(&id).ok()).collect();
        Ok(())
    }

    async fn rows_to_tasks(&self, rows: Vec<TaskRow>) -> DomainResult<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let mut task: Task = row.try_into()?;
            self.load_dependencies(&mut task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

/// Shared eligibility predicate over the aliased tables `t` (tasks),
/// `p` (projects), `k` (tickets). Dependency completeness, live ticket,
/// live project, per-project concurrency ceiling.
const ELIGIBLE_WHERE: &str = "t.status = 'pending'
    AND t.sandbox_id IS NULL
    AND p.archived = 0
    AND k.status NOT IN ('blocked', 'done')
    AND NOT EXISTS (
        SELECT 1 FROM task_dependencies d
        JOIN tasks dt ON dt.id = d.depends_on_id
        WHERE d.task_id = t.id AND dt.status != 'completed'
    )
    AND (
        SELECT COUNT(*) FROM tasks r
        WHERE r.project_id = p.id AND r.status IN ('assigned', 'running')
    ) < p.max_concurrent";

const PRIORITY_ORDER: &str = "CASE t.priority
        WHEN 'critical' THEN 1
        WHEN 'high' THEN 2
        WHEN 'medium' THEN 3
        ELSE 4
    END, t.created_at";

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> DomainResult<()> {
        task.validate().map_err(DomainError::ValidationFailed)?;

        let estimated_files = serde_json::to_string(&task.estimated_files)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let synthesis = task.synthesis_context.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"INSERT INTO tasks (id, ticket_id, project_id, phase_id, description, task_type,
               status, priority, sandbox_id, agent_id, estimated_files, result, synthesis_context,
               manual_release, retry_count, max_retries, last_error, version,
               created_at, updated_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task.id.to_string())
        .bind(task.ticket_id.to_string())
        .bind(task.project_id.to_string())
        .bind(&task.phase_id)
        .bind(&task.description)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.sandbox_id.map(|id| id.to_string()))
        .bind(&task.agent_id)
        .bind(&estimated_files)
        .bind(&result)
        .bind(&synthesis)
        .bind(i32::from(task.manual_release))
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(&task.last_error)
        .bind(task.version as i64)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        for dep_id in &task.depends_on {
            self.add_dependency(task.id, *dep_id).await?;
        }

        Ok(())
    }

    async fn get(&self, id: Uuid) -> DomainResult<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => {
                let mut task = r.try_into()?;
                self.load_dependencies(&mut task).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update(&self, task: &Task) -> DomainResult<()> {
        let estimated_files = serde_json::to_string(&task.estimated_files)?;
        let result = task.result.as_ref().map(serde_json::to_string).transpose()?;
        let synthesis = task.synthesis_context.as_ref().map(serde_json::to_string).transpose()?;

        let outcome = sqlx::query(
            r#"UPDATE tasks SET phase_id = ?, description = ?, task_type = ?, status = ?,
               priority = ?, sandbox_id = ?, agent_id = ?, estimated_files = ?, result = ?,
               synthesis_context = ?, manual_release = ?, retry_count = ?, max_retries = ?,
               last_error = ?, version = ?, updated_at = ?, started_at = ?, completed_at = ?
               WHERE id = ? AND version = ?"#,
        )
        .bind(&task.phase_id)
        .bind(&task.description)
        .bind(task.task_type.as_str())
        .bind(task.status.as_str())
        .bind(task.priority.as_str())
        .bind(task.sandbox_id.map(|id| id.to_string()))
        .bind(&task.agent_id)
        .bind(&estimated_files)
        .bind(&result)
        .bind(&synthesis)
        .bind(i32::from(task.manual_release))
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(&task.last_error)
        .bind(task.version as i64)
        .bind(task.updated_at.to_rfc3339())
        .bind(task.started_at.map(|t| t.to_rfc3339()))
        .bind(task.completed_at.map(|t| t.to_rfc3339()))
        .bind(task.id.to_string())
        .bind((task.version as i64) - 1)
        .execute(&self.pool)
        .await?;

        if outcome.rows_affected() == 0 {
            // Distinguish a missing row from a version race.
            let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM tasks WHERE id = ?")
                .bind(task.id.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return match exists {
                Some(_) => Err(DomainError::ConcurrencyConflict {
                    entity: "task".to_string(),
                    id: task.id.to_string(),
                }),
                None => Err(DomainError::TaskNotFound(task.id)),
            };
        }

        Ok(())
    }

    async fn list(&self, filter: TaskFilter) -> DomainResult<Vec<Task>> {
        let mut query = String::from("SELECT * FROM tasks WHERE 1=1");
        let mut bindings: Vec<String> = Vec::new();

        if let Some(status) = &filter.status {
            query.push_str(" AND status = ?");
            bindings.push(status.as_str().to_string());
        }
        if let Some(priority) = &filter.priority {
            query.push_str(" AND priority = ?");
            bindings.push(priority.as_str().to_string());
        }
        if let Some(ticket_id) = &filter.ticket_id {
            query.push_str(" AND ticket_id = ?");
            bindings.push(ticket_id.to_string());
        }
        if let Some(project_id) = &filter.project_id {
            query.push_str(" AND project_id = ?");
            bindings.push(project_id.to_string());
        }
        if let Some(phase_id) = &filter.phase_id {
            query.push_str(" AND phase_id = ?");
            bindings.push(phase_id.clone());
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }

        let rows: Vec<TaskRow> = q.fetch_all(&self.pool).await?;
        self.rows_to_tasks(rows).await
    }

    async fn claim_next_eligible(&self, agent_id: &str, filter: &ClaimFilter) -> DomainResult<Option<Task>> {
        let mut gates = String::new();
        let mut bindings: Vec<String> = Vec::new();

        if filter.autonomous_only {
            gates.push_str(" AND p.autonomous_mode = 1");
        } else {
            gates.push_str(" AND (p.autonomous_mode = 1 OR t.manual_release = 1)");
        }
        if let Some(phase_id) = &filter.phase_id {
            gates.push_str(" AND t.phase_id = ?");
            bindings.push(phase_id.clone());
        }
        if !filter.capabilities.is_empty() {
            let placeholders = vec!["?"; filter.capabilities.len()].join(", ");
            gates.push_str(&format!(" AND t.task_type IN ({placeholders})"));
            for cap in &filter.capabilities {
                bindings.push(cap.as_str().to_string());
            }
        }

        let query = format!(
            r#"UPDATE tasks SET status = 'assigned', agent_id = ?, version = version + 1, updated_at = ?
               WHERE id = (
                   SELECT t.id FROM tasks t
                   JOIN projects p ON p.id = t.project_id
                   JOIN tickets k ON k.id = t.ticket_id
                   WHERE {ELIGIBLE_WHERE}{gates}
                   ORDER BY {PRIORITY_ORDER}
                   LIMIT 1
               ) AND status = 'pending'
               RETURNING id"#,
        );

        let mut q = sqlx::query_as::<_, (String,)>(&query)
            .bind(agent_id)
            .bind(Utc::now().to_rfc3339());
        for binding in &bindings {
            q = q.bind(binding);
        }

        let claimed: Option<(String,)> = q.fetch_optional(&self.pool).await?;
        match claimed {
            Some((id,)) => self.get(super::parse_uuid(&id)?).await,
            None => Ok(None),
        }
    }

    async fn get_ready_batch(&self, phase_id: Option<&str>, limit: usize) -> DomainResult<Vec<Task>> {
        let mut gates = String::new();
        let mut bindings: Vec<String> = Vec::new();
        if let Some(phase) = phase_id {
            gates.push_str(" AND t.phase_id = ?");
            bindings.push(phase.to_string());
        }

        let query = format!(
            r#"SELECT t.* FROM tasks t
               JOIN projects p ON p.id = t.project_id
               JOIN tickets k ON k.id = t.ticket_id
               WHERE {ELIGIBLE_WHERE}{gates}
               ORDER BY {PRIORITY_ORDER}
               LIMIT ?"#,
        );

        let mut q = sqlx::query_as::<_, TaskRow>(&query);
        for binding in &bindings {
            q = q.bind(binding);
        }
        let rows: Vec<TaskRow> = q.bind(limit as i64).fetch_all(&self.pool).await?;
        self.rows_to_tasks(rows).await
    }

    async fn mark_running(&self, task_id: Uuid, sandbox_id: Uuid) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            r#"UPDATE tasks SET status = 'running', sandbox_id = ?, version = version + 1,
               updated_at = ?, started_at = ?
               WHERE id = ? AND status = 'assigned'"#,
        )
        .bind(sandbox_id.to_string())
        .bind(&now)
        .bind(&now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_completed(&self, task_id: Uuid, result: &serde_json::Value) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let result_json = serde_json::to_string(result)?;
        let outcome = sqlx::query(
            r#"UPDATE tasks SET status = 'completed', result = ?, last_error = NULL,
               version = version + 1, updated_at = ?, completed_at = ?
               WHERE id = ? AND status IN ('assigned', 'running')"#,
        )
        .bind(&result_json)
        .bind(&now)
        .bind(&now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_failed(&self, task_id: Uuid, reason: &str) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            r#"UPDATE tasks SET status = 'failed', last_error = ?,
               version = version + 1, updated_at = ?, completed_at = ?
               WHERE id = ? AND status IN ('assigned', 'running')"#,
        )
        .bind(reason)
        .bind(&now)
        .bind(&now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn mark_cancelled(&self, task_id: Uuid) -> DomainResult<bool> {
        let now = Utc::now().to_rfc3339();
        let outcome = sqlx::query(
            r#"UPDATE tasks SET status = 'cancelled', version = version + 1,
               updated_at = ?, completed_at = ?
               WHERE id = ? AND status IN ('pending', 'assigned', 'running')"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn release_claim(&self, task_id: Uuid) -> DomainResult<bool> {
        let outcome = sqlx::query(
            r#"UPDATE tasks SET status = 'pending', agent_id = NULL, version = version + 1,
               updated_at = ?
               WHERE id = ? AND status = 'assigned'"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn requeue_for_retry(&self, task_id: Uuid) -> DomainResult<bool> {
        let outcome = sqlx::query(
            r#"UPDATE tasks SET status = 'pending', sandbox_id = NULL, agent_id = NULL,
               retry_count = retry_count + 1, version = version + 1, updated_at = ?
               WHERE id = ? AND status IN ('failed', 'cancelled') AND retry_count < max_retries"#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn record_error(&self, task_id: Uuid, reason: &str) -> DomainResult<()> {
        let outcome = sqlx::query(
            "UPDATE tasks SET last_error = ?, version = version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn set_synthesis_context(&self, task_id: Uuid, context: &serde_json::Value) -> DomainResult<()> {
        let json = serde_json::to_string(context)?;
        let outcome = sqlx::query(
            "UPDATE tasks SET synthesis_context = ?, version = version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(&json)
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn set_manual_release(&self, task_id: Uuid, released: bool) -> DomainResult<()> {
        let outcome = sqlx::query(
            "UPDATE tasks SET manual_release = ?, version = version + 1, updated_at = ? WHERE id = ?",
        )
        .bind(i32::from(released))
        .bind(Utc::now().to_rfc3339())
        .bind(task_id.to_string())
        .execute(&self.pool)
        .await?;
        if outcome.rows_affected() == 0 {
            return Err(DomainError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn get_dependencies(&self, task_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               INNER JOIN task_dependencies d ON t.id = d.depends_on_id
               WHERE d.task_id = ?"#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn get_dependents(&self, task_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               INNER JOIN task_dependencies d ON t.id = d.task_id
               WHERE d.depends_on_id = ?"#,
        )
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn add_dependency(&self, task_id: Uuid, depends_on: Uuid) -> DomainResult<()> {
        sqlx::query("INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?, ?)")
            .bind(task_id.to_string())
            .bind(depends_on.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_unblocked_by(&self, completed_task_id: Uuid) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"SELECT t.* FROM tasks t
               JOIN task_dependencies d ON d.task_id = t.id AND d.depends_on_id = ?
               WHERE t.status = 'pending' AND t.sandbox_id IS NULL
                 AND NOT EXISTS (
                     SELECT 1 FROM task_dependencies d2
                     JOIN tasks dt ON dt.id = d2.depends_on_id
                     WHERE d2.task_id = t.id AND dt.status != 'completed'
                 )"#,
        )
        .bind(completed_task_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_to_tasks(rows).await
    }

    async fn count_in_flight(&self, project_id: Option<Uuid>) -> DomainResult<u64> {
        let count: (i64,) = match project_id {
            Some(pid) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM tasks WHERE project_id = ? AND status IN ('assigned', 'running')",
                )
                .bind(pid.to_string())
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE status IN ('assigned', 'running')")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        Ok(count.0 as u64)
    }

    async fn list_running(&self) -> DomainResult<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as("SELECT * FROM tasks WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        self.rows_to_tasks(rows).await
    }

    async fn reset_orphaned(&self, live_sandbox_ids: &[Uuid]) -> DomainResult<u64> {
        let placeholders = if live_sandbox_ids.is_empty() {
            "''".to_string()
        } else {
            vec!["?"; live_sandbox_ids.len()].join(", ")
        };
        let query = format!(
            r#"UPDATE tasks SET status = 'pending', sandbox_id = NULL, agent_id = NULL,
               version = version + 1, updated_at = ?
               WHERE status IN ('assigned', 'running')
                 AND (sandbox_id IS NULL OR sandbox_id NOT IN ({placeholders}))"#,
        );

        let mut q = sqlx::query(&query).bind(Utc::now().to_rfc3339());
        for id in live_sandbox_ids {
            q = q.bind(id.to_string());
        }
        let outcome = q.execute(&self.pool).await?;
        Ok(outcome.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    ticket_id: String,
    project_id: String,
    phase_id: String,
    description: String,
    task_type: String,
    status: String,
    priority: String,
    sandbox_id: Option<String>,
    agent_id: Option<String>,
    estimated_files: Option<String>,
    result: Option<String>,
    synthesis_context: Option<String>,
    manual_release: i32,
    retry_count: i32,
    max_retries: i32,
    last_error: Option<String>,
    version: i64,
    created_at: String,
    updated_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = DomainError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = TaskStatus::from_str(&row.status)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid status: {}", row.status)))?;
        let priority = Priority::from_str(&row.priority)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid priority: {}", row.priority)))?;
        let task_type = TaskType::from_str(&row.task_type)
            .ok_or_else(|| DomainError::SerializationError(format!("Invalid task_type: {}", row.task_type)))?;

        Ok(Task {
            id: super::parse_uuid(&row.id)?,
            ticket_id: super::parse_uuid(&row.ticket_id)?,
            project_id: super::parse_uuid(&row.project_id)?,
            phase_id: row.phase_id,
            description: row.description,
            task_type,
            status,
            priority,
            sandbox_id: super::parse_optional_uuid(row.sandbox_id)?,
            agent_id: row.agent_id,
            depends_on: Vec::new(), // Loaded separately
            estimated_files: super::parse_json_or_default(row.estimated_files)?,
            result: super::parse_optional_json(row.result)?,
            synthesis_context: super::parse_optional_json(row.synthesis_context)?,
            manual_release: row.manual_release != 0,
            retry_count: row.retry_count as u32,
            max_retries: row.max_retries as u32,
            last_error: row.last_error,
            version: row.version as u64,
            created_at: super::parse_datetime(&row.created_at)?,
            updated_at: super::parse_datetime(&row.updated_at)?,
            started_at: super::parse_optional_datetime(row.started_at)?,
            completed_at: super::parse_optional_datetime(row.completed_at)?,
        })
    }
}
