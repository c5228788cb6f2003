//! Sandbox repository port, including session transcripts.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Sandbox, SandboxStatus, SessionTranscript};

#[async_trait]
pub trait SandboxRepository: Send + Sync {
    async fn create(&self, sandbox: &Sandbox) -> DomainResult<()>;

    async fn get(&self, id: Uuid) -> DomainResult<Option<Sandbox>>;

    async fn get_by_task(&self, task_id: Uuid) -> DomainResult<Option<Sandbox>>;

    async fn set_status(&self, id: Uuid, status: SandboxStatus) -> DomainResult<()>;

    /// Sandboxes not yet terminated.
    async fn list_active(&self) -> DomainResult<Vec<Sandbox>>;

    /// Upsert the transcript for (task, phase).
    async fn save_transcript(&self, transcript: &SessionTranscript) -> DomainResult<()>;

    async fn get_transcript(&self, task_id: Uuid, phase_id: &str) -> DomainResult<Option<SessionTranscript>>;
}
