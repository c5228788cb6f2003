//! Application services: the orchestration core.

pub mod coordination;
pub mod convergence_merger;
pub mod discovery_service;
pub mod event_bus;
pub mod event_store;
pub mod events;
pub mod guardian;
pub mod lock_manager;
pub mod orchestrator;
pub mod phase_engine;
pub mod phase_registry;
pub mod retry;
pub mod sandbox_spawner;
pub mod synthesis;
pub mod task_queue;

pub use coordination::{merge, CoordinationService};
pub use convergence_merger::{ConflictResolver, ConvergenceMerger, MergerConfig, NoopConflictResolver};
pub use discovery_service::{DiscoveryConfig, DiscoveryService};
pub use event_bus::{
    DriveHandle, EventBus, EventBusConfig, EventHandler, RemoteSinkConfig, SubscriptionHandle,
};
pub use event_store::{EventStore, EventStoreError, InMemoryEventStore};
pub use events::{Event, EventId, EventPayload, SequenceNumber, SteeringKind};
pub use guardian::{GuardianConfig, GuardianMonitor, StuckAgent};
pub use lock_manager::LockManager;
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use phase_engine::{GateCheck, GateReport, PhaseEngine, TransitionOutcome};
pub use phase_registry::PhaseRegistry;
pub use retry::RetryPolicy;
pub use sandbox_spawner::{ResumeHandle, SandboxSpawner, SandboxSpawnerConfig};
pub use synthesis::SynthesisService;
pub use task_queue::TaskQueue;
