//! Project repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::Project;

#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn create(&self, project: &Project) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Project>>;

    async fn update(&self, project: &Project) -> DomainResult<()>;

    async fn list(&self, include_archived: bool) -> DomainResult<Vec<Project>>;

    /// Soft archive; projects are never hard-deleted while referenced.
    async fn archive(&self, id: Uuid) -> DomainResult<()>;

    async fn set_autonomous_mode(&self, id: Uuid, on: bool) -> DomainResult<()>;
}
