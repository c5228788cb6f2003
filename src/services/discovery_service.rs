//! Discovery service: records agent findings and branches follow-up work
//! into arbitrary phases, bypassing normal transition rules.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{hash_description, Discovery, DiscoveryKind, Task, TaskType};
use crate::domain::ports::DiscoveryRepository;

use super::event_bus::EventBus;
use super::events::EventPayload;
use super::phase_registry::PhaseRegistry;
use super::task_queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Window within which identical discoveries from the same task dedup.
    pub dedup_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { dedup_window: Duration::minutes(10) }
    }
}

pub struct DiscoveryService {
    repo: Arc<dyn DiscoveryRepository>,
    queue: Arc<TaskQueue>,
    registry: Arc<PhaseRegistry>,
    bus: Arc<EventBus>,
    config: DiscoveryConfig,
}

impl DiscoveryService {
    pub fn new(
        repo: Arc<dyn DiscoveryRepository>,
        queue: Arc<TaskQueue>,
        registry: Arc<PhaseRegistry>,
        bus: Arc<EventBus>,
        config: DiscoveryConfig,
    ) -> Self {
        Self { repo, queue, registry, bus, config }
    }

    /// Record a discovery and spawn its follow-up task into `target_phase`,
    /// depending on the source task. The target phase need not be in any
    /// `allowed_next` set. Duplicates within the dedup window return the
    /// original record instead of spawning again.
    #[instrument(skip(self, description), fields(%source_task_id, kind = kind.as_str(), target_phase))]
    pub async fn record_and_branch(
        &self,
        source_task_id: Uuid,
        kind: DiscoveryKind,
        description: &str,
        target_phase: &str,
        priority_boost: bool,
        estimated_files: Vec<String>,
    ) -> DomainResult<Discovery> {
        let source = self
            .queue
            .get(source_task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(source_task_id))?;

        // The phase must exist for the project, but normal transition rules
        // do not apply: discovery bypasses allowed_next by design.
        self.registry.require(source.project_id, target_phase).await?;

        let description_hash = hash_description(description);
        let since = Utc::now() - self.config.dedup_window;
        if let Some(existing) = self
            .repo
            .find_duplicate(source_task_id, kind, &description_hash, since)
            .await?
        {
            info!(discovery_id = %existing.id, "Duplicate discovery suppressed");
            return Ok(existing);
        }

        let priority = if priority_boost { source.priority.boosted() } else { source.priority };
        let follow_up = Task::new(source.ticket_id, source.project_id, target_phase, description)
            .with_dependency(source_task_id)
            .with_priority(priority)
            .with_task_type(follow_up_type(kind))
            .with_estimated_files(estimated_files);
        let follow_up = self.queue.enqueue(follow_up).await?;

        let discovery = Discovery::new(
            source_task_id,
            kind,
            description,
            target_phase,
            priority_boost,
            follow_up.id,
        );
        self.repo.create(&discovery).await?;

        info!(discovery_id = %discovery.id, spawned_task = %follow_up.id, "Discovery recorded");
        self.bus
            .publish(EventPayload::DiscoveryRecorded {
                discovery_id: discovery.id,
                source_task_id,
                kind,
            })
            .await;

        Ok(discovery)
    }

    pub async fn list_by_source(&self, source_task_id: Uuid) -> DomainResult<Vec<Discovery>> {
        self.repo.list_by_source(source_task_id).await
    }
}

fn follow_up_type(kind: DiscoveryKind) -> TaskType {
    match kind {
        DiscoveryKind::Clarification => TaskType::Research,
        _ => TaskType::Standard,
    }
}
