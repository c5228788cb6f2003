//! Service graph assembly shared by the CLI commands and the orchestrate
//! daemon.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::sqlite::{
    initialize_database, SqliteDiscoveryRepository, SqliteEventStore, SqliteJoinRepository,
    SqliteLockRepository, SqlitePhaseRepository, SqliteProjectRepository, SqliteSandboxRepository,
    SqliteTaskRepository, SqliteTicketRepository,
};
use crate::domain::ports::{
    DiscoveryRepository, JoinRepository, LockRepository, PhaseRepository, ProjectRepository,
    SandboxRepository, TaskRepository, TicketRepository,
};
use crate::infrastructure::Config;
use crate::services::{
    CoordinationService, ConvergenceMerger, DiscoveryConfig, DiscoveryService, EventBus,
    EventBusConfig, EventStore, GuardianConfig, GuardianMonitor, LockManager, MergerConfig,
    NoopConflictResolver, Orchestrator, OrchestratorConfig, PhaseEngine, PhaseRegistry,
    RemoteSinkConfig, RetryPolicy, SandboxSpawner, SandboxSpawnerConfig, SynthesisService,
    TaskQueue,
};

/// Fully wired service graph over one database pool.
pub struct App {
    pub pool: SqlitePool,
    pub bus: Arc<EventBus>,
    pub event_store: Arc<dyn EventStore>,
    pub projects: Arc<dyn ProjectRepository>,
    pub tickets: Arc<dyn TicketRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub queue: Arc<TaskQueue>,
    pub locks: Arc<LockManager>,
    pub registry: Arc<PhaseRegistry>,
    pub engine: Arc<PhaseEngine>,
    pub discovery: Arc<DiscoveryService>,
    pub coordination: Arc<CoordinationService>,
    pub synthesis: Arc<SynthesisService>,
    pub merger: Arc<ConvergenceMerger>,
    pub spawner: Arc<SandboxSpawner>,
    pub guardian: Arc<GuardianMonitor>,
    pub orchestrator: Arc<Orchestrator>,
}

impl App {
    pub async fn build(config: &Config) -> Result<Self> {
        let database_url = format!("sqlite:{}", config.database.path);
        let pool = initialize_database(&database_url)
            .await
            .context("Failed to initialize database")?;
        Self::build_with_pool(config, pool)
    }

    pub fn build_with_pool(config: &Config, pool: SqlitePool) -> Result<Self> {
        let event_store: Arc<dyn EventStore> = Arc::new(SqliteEventStore::new(pool.clone()));
        let remote = (!config.events.remote_endpoint.is_empty()).then(|| RemoteSinkConfig {
            endpoint: config.events.remote_endpoint.clone(),
            retry: RetryPolicy::new(3, 200, 5_000),
            queue_capacity: config.events.remote_queue_capacity,
        });
        let bus = Arc::new(
            EventBus::new(EventBusConfig {
                channel_capacity: config.events.channel_capacity,
                persist_events: config.events.persist,
                remote,
            })
            .with_store(Arc::clone(&event_store)),
        );

        let projects: Arc<dyn ProjectRepository> = Arc::new(SqliteProjectRepository::new(pool.clone()));
        let tickets: Arc<dyn TicketRepository> = Arc::new(SqliteTicketRepository::new(pool.clone()));
        let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let phases: Arc<dyn PhaseRepository> = Arc::new(SqlitePhaseRepository::new(pool.clone()));
        let lock_repo: Arc<dyn LockRepository> = Arc::new(SqliteLockRepository::new(pool.clone()));
        let join_repo: Arc<dyn JoinRepository> = Arc::new(SqliteJoinRepository::new(pool.clone()));
        let discovery_repo: Arc<dyn DiscoveryRepository> =
            Arc::new(SqliteDiscoveryRepository::new(pool.clone()));
        let sandbox_repo: Arc<dyn SandboxRepository> = Arc::new(SqliteSandboxRepository::new(pool.clone()));

        let queue = Arc::new(TaskQueue::new(Arc::clone(&tasks), Arc::clone(&bus)));
        let locks = Arc::new(LockManager::new(Arc::clone(&lock_repo)));
        let registry = Arc::new(PhaseRegistry::new(Arc::clone(&phases)));

        let worktrees_root = PathBuf::from(&config.sandbox.worktrees_root);
        let spawner = Arc::new(SandboxSpawner::new(
            Arc::clone(&sandbox_repo),
            Arc::clone(&bus),
            SandboxSpawnerConfig {
                worktrees_root: worktrees_root.clone(),
                event_publish_url: config.sandbox.event_publish_url.clone(),
                task_complete_url: config.sandbox.task_complete_url.clone(),
                runtime_command: (!config.sandbox.runtime_command.is_empty())
                    .then(|| config.sandbox.runtime_command.clone()),
                terminate_grace: Duration::from_secs(config.sandbox.terminate_grace_secs),
            },
        ));

        let engine = Arc::new(PhaseEngine::new(
            Arc::clone(&tickets),
            Arc::clone(&registry),
            Arc::clone(&bus),
            worktrees_root,
        ));
        let discovery = Arc::new(DiscoveryService::new(
            discovery_repo,
            Arc::clone(&queue),
            Arc::clone(&registry),
            Arc::clone(&bus),
            DiscoveryConfig::default(),
        ));
        let coordination = Arc::new(CoordinationService::new(Arc::clone(&join_repo), Arc::clone(&queue)));
        let synthesis = Arc::new(SynthesisService::new(
            Arc::clone(&join_repo),
            Arc::clone(&queue),
            Arc::clone(&bus),
        ));
        let merger = Arc::new(ConvergenceMerger::new(
            Arc::clone(&queue),
            Arc::clone(&tickets),
            Arc::clone(&projects),
            Arc::clone(&join_repo),
            Arc::clone(&spawner),
            Arc::new(NoopConflictResolver),
            Arc::clone(&bus),
            MergerConfig {
                base_branch: config.orchestrator.base_branch.clone(),
                ..MergerConfig::default()
            },
        ));
        let guardian = Arc::new(GuardianMonitor::new(
            Arc::clone(&tasks),
            Arc::clone(&bus),
            GuardianConfig::default(),
        ));

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&queue),
            Arc::clone(&locks),
            Arc::clone(&engine),
            Arc::clone(&discovery),
            Arc::clone(&coordination),
            Arc::clone(&synthesis),
            Arc::clone(&merger),
            Arc::clone(&spawner),
            Arc::clone(&guardian),
            Arc::clone(&tickets),
            Arc::clone(&projects),
            Arc::clone(&bus),
            OrchestratorConfig {
                workers: config.orchestrator.workers,
                poll_interval: Duration::from_millis(config.orchestrator.poll_interval_ms),
                sweep_interval: Duration::from_secs(config.orchestrator.sweep_interval_secs),
                retry: RetryPolicy::new(
                    config.orchestrator.max_retries,
                    config.orchestrator.initial_backoff_ms,
                    config.orchestrator.max_backoff_ms,
                ),
                base_branch: config.orchestrator.base_branch.clone(),
                enforce_capacity: config.orchestrator.enforce_capacity,
                shutdown_grace: Duration::from_secs(config.orchestrator.shutdown_grace_secs),
                ..OrchestratorConfig::default()
            },
        ));

        Ok(Self {
            pool,
            bus,
            event_store,
            projects,
            tickets,
            tasks,
            queue,
            locks,
            registry,
            engine,
            discovery,
            coordination,
            synthesis,
            merger,
            spawner,
            guardian,
            orchestrator,
        })
    }
}
