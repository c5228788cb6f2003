//! Resource lock repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{LockMode, ResourceLock, ResourceType};

#[async_trait]
pub trait LockRepository: Send + Sync {
    /// Atomic conflict-probe-and-insert inside one transaction. Returns
    /// `Contention` when an active conflicting lock exists.
    async fn try_acquire(&self, lock: &ResourceLock) -> DomainResult<ResourceLock>;

    /// Idempotent: releasing a released lock is a no-op.
    async fn release(&self, lock_id: Uuid) -> DomainResult<()>;

    /// Idempotent bulk release of every active lock owned by a task.
    /// Returns the number actually released.
    async fn release_by_task(&self, task_id: Uuid) -> DomainResult<u64>;

    /// Release locks whose expiry has passed; returns the count.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<u64>;

    async fn list_active(&self) -> DomainResult<Vec<ResourceLock>>;

    async fn list_by_task(&self, task_id: Uuid) -> DomainResult<Vec<ResourceLock>>;

    /// Whether an active lock on the resource conflicts with a request in
    /// `mode`, ignoring locks held by `exclude_task`.
    async fn has_conflict(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        mode: LockMode,
        exclude_task: Option<Uuid>,
    ) -> DomainResult<bool>;
}
