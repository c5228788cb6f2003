//! Phase registry: read-mostly cache over phase definitions.
//!
//! Definitions are immutable in-flight. `upsert` writes through and
//! invalidates the project's cache entry, so edits only affect future
//! transitions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{default_phases, PhaseDef};
use crate::domain::ports::PhaseRepository;

pub struct PhaseRegistry {
    repo: Arc<dyn PhaseRepository>,
    cache: RwLock<HashMap<Uuid, Arc<Vec<PhaseDef>>>>,
}

impl PhaseRegistry {
    pub fn new(repo: Arc<dyn PhaseRepository>) -> Self {
        Self {
            repo,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Install the built-in phase set for a new project.
    pub async fn install_defaults(&self, project_id: Uuid) -> DomainResult<()> {
        for phase in default_phases() {
            self.repo.upsert(project_id, &phase).await?;
        }
        self.invalidate(project_id).await;
        info!(%project_id, "Installed default phases");
        Ok(())
    }

    /// Overlay custom phase definitions from a YAML file. Each entry either
    /// replaces a default phase (same id) or adds a new one.
    pub async fn load_overlay_from_yaml(&self, project_id: Uuid, path: &Path) -> DomainResult<usize> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DomainError::ValidationFailed(format!("Cannot read {}: {e}", path.display())))?;
        let phases: Vec<PhaseDef> = serde_yaml::from_str(&raw)
            .map_err(|e| DomainError::SerializationError(format!("Invalid phase overlay: {e}")))?;

        for phase in &phases {
            phase.validate().map_err(DomainError::ValidationFailed)?;
            self.repo.upsert(project_id, phase).await?;
        }
        self.invalidate(project_id).await;
        info!(%project_id, count = phases.len(), "Applied phase overlay");
        Ok(phases.len())
    }

    pub async fn upsert(&self, project_id: Uuid, phase: &PhaseDef) -> DomainResult<()> {
        self.repo.upsert(project_id, phase).await?;
        self.invalidate(project_id).await;
        Ok(())
    }

    /// Definition lookup, cached per project.
    pub async fn get(&self, project_id: Uuid, phase_id: &str) -> DomainResult<Option<PhaseDef>> {
        let phases = self.list(project_id).await?;
        Ok(phases.iter().find(|p| p.id == phase_id).cloned())
    }

    /// Like [`Self::get`], but a missing phase is an error.
    pub async fn require(&self, project_id: Uuid, phase_id: &str) -> DomainResult<PhaseDef> {
        self.get(project_id, phase_id)
            .await?
            .ok_or_else(|| DomainError::PhaseNotFound(phase_id.to_string()))
    }

    pub async fn list(&self, project_id: Uuid) -> DomainResult<Arc<Vec<PhaseDef>>> {
        if let Some(cached) = self.cache.read().await.get(&project_id) {
            return Ok(Arc::clone(cached));
        }
        let phases = Arc::new(self.repo.list_for_project(project_id).await?);
        self.cache.write().await.insert(project_id, Arc::clone(&phases));
        Ok(phases)
    }

    async fn invalidate(&self, project_id: Uuid) {
        self.cache.write().await.remove(&project_id);
    }
}
