//! Resource lock manager: mutual exclusion on files and named resources.
//!
//! Non-blocking contention policy: callers that lose the race get
//! `DomainError::Contention` and must retry themselves; the orchestrator
//! responds by deferring the task and claiming other work. Crash recovery
//! relies on the periodic expiry sweep.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{LockMode, ResourceLock, ResourceType};
use crate::domain::ports::LockRepository;

pub struct LockManager {
    repo: Arc<dyn LockRepository>,
    /// Default lease TTL applied when callers pass no explicit TTL.
    default_ttl: Duration,
}

impl LockManager {
    pub fn new(repo: Arc<dyn LockRepository>) -> Self {
        Self {
            repo,
            default_ttl: Duration::minutes(30),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Atomically acquire a lease. Returns `Contention` when an active
    /// conflicting lock exists.
    #[instrument(skip(self), fields(resource = %resource_id, mode = mode.as_str()))]
    pub async fn acquire(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        task_id: Uuid,
        agent_id: &str,
        mode: LockMode,
        ttl: Option<Duration>,
    ) -> DomainResult<ResourceLock> {
        let lock = ResourceLock::new(
            resource_type,
            resource_id,
            task_id,
            agent_id,
            mode,
            Some(ttl.unwrap_or(self.default_ttl)),
        );
        let acquired = self.repo.try_acquire(&lock).await?;
        debug!(lock_id = %acquired.id, "Lock acquired");
        Ok(acquired)
    }

    /// Exclusive file leases for every path a task expects to touch.
    /// All-or-nothing: on contention midway, already-acquired leases are
    /// released before the error propagates.
    pub async fn acquire_files(
        &self,
        paths: &[String],
        task_id: Uuid,
        agent_id: &str,
        ttl: Option<Duration>,
    ) -> DomainResult<Vec<ResourceLock>> {
        let mut acquired = Vec::with_capacity(paths.len());
        for path in paths {
            match self
                .acquire(ResourceType::File, path, task_id, agent_id, LockMode::Exclusive, ttl)
                .await
            {
                Ok(lock) => acquired.push(lock),
                Err(e) => {
                    for lock in &acquired {
                        self.repo.release(lock.id).await.ok();
                    }
                    return Err(e);
                }
            }
        }
        Ok(acquired)
    }

    /// Whether any of `paths` is exclusively locked by another task.
    pub async fn any_file_conflict(&self, paths: &[String], exclude_task: Option<Uuid>) -> DomainResult<bool> {
        for path in paths {
            if self
                .repo
                .has_conflict(ResourceType::File, path, LockMode::Exclusive, exclude_task)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Idempotent.
    pub async fn release(&self, lock_id: Uuid) -> DomainResult<()> {
        self.repo.release(lock_id).await
    }

    /// Idempotent bulk release; returns the number actually released.
    pub async fn release_by_task(&self, task_id: Uuid) -> DomainResult<u64> {
        let released = self.repo.release_by_task(task_id).await?;
        if released > 0 {
            debug!(%task_id, released, "Released task locks");
        }
        Ok(released)
    }

    /// Release expired leases. Invoked periodically by the orchestrator.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<u64> {
        let swept = self.repo.sweep_expired(now).await?;
        if swept > 0 {
            info!(swept, "Swept expired locks");
        }
        Ok(swept)
    }

    pub async fn list_active(&self) -> DomainResult<Vec<ResourceLock>> {
        self.repo.list_active().await
    }
}

/// Convenience for retry loops: is this error a lock contention?
pub fn is_contention(err: &DomainError) -> bool {
    matches!(err, DomainError::Contention { .. })
}
