//! Phase definition repository port.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::PhaseDef;

/// Read-mostly store of phase definitions keyed by (project, phase id).
///
/// Definitions are immutable in-flight: `upsert` affects future transitions
/// only, which the registry realizes by reloading its cache.
#[async_trait]
pub trait PhaseRepository: Send + Sync {
    async fn upsert(&self, project_id: Uuid, phase: &PhaseDef) -> DomainResult<()>;

    async fn get(&self, project_id: Uuid, phase_id: &str) -> DomainResult<Option<PhaseDef>>;

    async fn list_for_project(&self, project_id: Uuid) -> DomainResult<Vec<PhaseDef>>;
}
