//! Repository ports (hexagonal boundaries) for the orchestration core.

pub mod discovery_repository;
pub mod join_repository;
pub mod lock_repository;
pub mod phase_repository;
pub mod project_repository;
pub mod sandbox_repository;
pub mod task_repository;
pub mod ticket_repository;

pub use discovery_repository::DiscoveryRepository;
pub use join_repository::JoinRepository;
pub use lock_repository::LockRepository;
pub use phase_repository::PhaseRepository;
pub use project_repository::ProjectRepository;
pub use sandbox_repository::SandboxRepository;
pub use task_repository::{ClaimFilter, TaskFilter, TaskRepository};
pub use ticket_repository::TicketRepository;
