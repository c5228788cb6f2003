//! Coordination repository port: joins, sync points, merge attempt log.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{JoinRegistration, MergeAttempt, SyncPoint};

#[async_trait]
pub trait JoinRepository: Send + Sync {
    async fn create(&self, join: &JoinRegistration) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<JoinRegistration>>;

    async fn get_by_continuation(&self, continuation_task_id: Uuid) -> DomainResult<Option<JoinRegistration>>;

    /// Waiting joins whose source set contains the given task.
    async fn find_waiting_with_source(&self, source_task_id: Uuid) -> DomainResult<Vec<JoinRegistration>>;

    async fn list_waiting(&self) -> DomainResult<Vec<JoinRegistration>>;

    /// Persist arrival/status changes. Guarded on the current status so a
    /// join cannot regress from ready/failed back to waiting.
    async fn update(&self, join: &JoinRegistration) -> DomainResult<()>;

    async fn create_sync_point(&self, sync_point: &SyncPoint) -> DomainResult<()>;

    async fn get_sync_point(&self, name: &str) -> DomainResult<Option<SyncPoint>>;

    async fn update_sync_point(&self, sync_point: &SyncPoint) -> DomainResult<()>;

    async fn find_waiting_sync_points_with_source(&self, source_task_id: Uuid) -> DomainResult<Vec<SyncPoint>>;

    /// Append to the durable merge attempt log.
    async fn append_merge_attempt(&self, attempt: &MergeAttempt) -> DomainResult<()>;

    async fn list_merge_attempts(&self, join_id: Uuid) -> DomainResult<Vec<MergeAttempt>>;
}
