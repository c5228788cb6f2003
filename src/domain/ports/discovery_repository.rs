//! Discovery repository port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Discovery, DiscoveryKind};

#[async_trait]
pub trait DiscoveryRepository: Send + Sync {
    async fn create(&self, discovery: &Discovery) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Discovery>>;

    async fn list_by_source(&self, source_task_id: Uuid) -> DomainResult<Vec<Discovery>>;

    /// Duplicate probe on (source, kind, description hash) created at or
    /// after `since`.
    async fn find_duplicate(
        &self,
        source_task_id: Uuid,
        kind: DiscoveryKind,
        description_hash: &str,
        since: DateTime<Utc>,
    ) -> DomainResult<Option<Discovery>>;
}
