//! Subscriber side of the orchestrator: completion, failure, and
//! stuck-agent recovery.
//!
//! The status-guarded repository updates make every handler idempotent:
//! whichever of the event path or the completion callback lands first
//! performs the transition, and the other becomes a no-op.

use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::DiscoveryKind;
use crate::domain::ports::TaskFilter;

use super::super::events::{Event, EventPayload};
use super::super::phase_engine::TransitionOutcome;
use super::Orchestrator;

impl Orchestrator {
    /// Subscribe the orchestrator's own handlers.
    pub(crate) async fn register_event_handlers(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        self.bus
            .subscribe(
                "task.*",
                Arc::new(move |event: Event| {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move {
                        orchestrator.handle_task_event(event).await;
                    })
                }),
            )
            .await;

        let orchestrator = Arc::clone(self);
        self.bus
            .subscribe(
                "agent.stuck",
                Arc::new(move |event: Event| {
                    let orchestrator = Arc::clone(&orchestrator);
                    Box::pin(async move {
                        if let EventPayload::AgentStuck { task_id, .. } = event.payload {
                            if let Err(e) = orchestrator.recover_stuck_task(task_id).await {
                                warn!(%task_id, "Stuck recovery failed: {e}");
                            }
                        }
                    })
                }),
            )
            .await;
    }

    async fn handle_task_event(self: &Arc<Self>, event: Event) {
        let outcome = match event.payload {
            EventPayload::TaskCompleted { task_id, ref result } => {
                self.on_task_completed_event(task_id, result.clone()).await
            }
            EventPayload::TaskFailed { task_id, ref reason } => {
                self.on_task_failed_event(task_id, reason).await
            }
            _ => Ok(()),
        };
        if let Err(e) = outcome {
            warn!("Task event handling failed: {e}");
        }
    }

    /// Event-path completion (the sandbox runtime published the event
    /// itself). The guarded update decides whether this handler or the
    /// callback owns the post-completion work.
    async fn on_task_completed_event(self: &Arc<Self>, task_id: Uuid, result: serde_json::Value) -> DomainResult<()> {
        let transitioned = self.queue.repo().mark_completed(task_id, &result).await?;
        if transitioned {
            self.post_completion(task_id).await?;
        }
        Ok(())
    }

    async fn on_task_failed_event(self: &Arc<Self>, task_id: Uuid, reason: &str) -> DomainResult<()> {
        let transitioned = self.queue.repo().mark_failed(task_id, reason).await?;
        if transitioned {
            self.post_failure(task_id, reason).await?;
        }
        Ok(())
    }

    /// Work after a completion transition: checkpoint the session, tear the
    /// sandbox down, release ownership, unblock dependents, and try to
    /// advance the ticket's phase.
    #[instrument(skip(self))]
    pub(crate) async fn post_completion(self: &Arc<Self>, task_id: Uuid) -> DomainResult<Vec<Uuid>> {
        let task = self
            .queue
            .get(task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(task_id))?;

        if let Some(sandbox_id) = task.sandbox_id {
            if let Some(sandbox) = self.spawner.list_active().await?.into_iter().find(|s| s.id == sandbox_id) {
                self.spawner.capture_transcript(&sandbox, &task.phase_id).await.ok();
            }
            self.spawner.terminate(sandbox_id).await.ok();
        }
        self.locks.release_by_task(task_id).await?;

        let unblocked = self.queue.recompute_unblocked(task_id).await?;
        let unblocked_ids: Vec<Uuid> = unblocked.iter().map(|t| t.id).collect();

        // Once the last task of the ticket's current phase finishes, attempt
        // the normal next-phase transition; the gate decides the outcome.
        if self.phase_tasks_all_terminal(&task).await? {
            match self.engine.try_advance(task.ticket_id, "orchestrator").await {
                Ok(Some(TransitionOutcome::Transitioned)) => {
                    info!(ticket_id = %task.ticket_id, "Ticket advanced");
                }
                Ok(_) => {}
                Err(e) => warn!(ticket_id = %task.ticket_id, "Phase advance failed: {e}"),
            }
        }

        Ok(unblocked_ids)
    }

    /// Work after a failure transition: teardown, then the retry policy:
    /// exponential backoff with jitter up to max retries, then permanent
    /// failure recorded as a bug discovery.
    #[instrument(skip(self))]
    pub(crate) async fn post_failure(self: &Arc<Self>, task_id: Uuid, reason: &str) -> DomainResult<()> {
        let task = self
            .queue
            .get(task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(task_id))?;

        if let Some(sandbox_id) = task.sandbox_id {
            if let Some(sandbox) = self.spawner.list_active().await?.into_iter().find(|s| s.id == sandbox_id) {
                self.spawner.capture_transcript(&sandbox, &task.phase_id).await.ok();
            }
            self.spawner.terminate(sandbox_id).await.ok();
        }
        self.locks.release_by_task(task_id).await?;

        if task.can_retry() {
            let delay = self.config.retry.backoff_for(task.retry_count, seed_from(task_id));
            info!(%task_id, retry = task.retry_count + 1, delay_ms = delay.as_millis() as u64, "Scheduling retry");
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = orchestrator.queue.requeue_for_retry(task_id).await {
                    warn!(%task_id, "Retry requeue failed: {e}");
                }
            });
            return Ok(());
        }

        warn!(%task_id, reason, "Task failed permanently");
        let description = format!(
            "Task failed permanently after {} attempt(s): {reason}",
            task.retry_count + 1
        );
        if let Err(e) = self
            .discovery
            .record_and_branch(
                task_id,
                DiscoveryKind::Bug,
                &description,
                &task.phase_id,
                false,
                task.estimated_files.clone(),
            )
            .await
        {
            warn!(%task_id, "Failed to record permanent-failure discovery: {e}");
        }
        Ok(())
    }

    /// Stuck-agent recovery: cancel, release, checkpoint, and requeue with
    /// the retry counter bumped so the next spawn resumes the session.
    #[instrument(skip(self))]
    pub async fn recover_stuck_task(self: &Arc<Self>, task_id: Uuid) -> DomainResult<()> {
        let task = self
            .queue
            .get(task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Ok(()); // The task resolved while the alarm was in flight.
        }

        if let Some(sandbox_id) = task.sandbox_id {
            if let Some(sandbox) = self.spawner.list_active().await?.into_iter().find(|s| s.id == sandbox_id) {
                self.spawner.capture_transcript(&sandbox, &task.phase_id).await.ok();
            }
            self.spawner.terminate(sandbox_id).await.ok();
        }

        self.queue.cancel(task_id).await?;
        self.locks.release_by_task(task_id).await?;
        if self.queue.requeue_for_retry(task_id).await? {
            info!(%task_id, "Stuck task requeued for retry");
        } else {
            warn!(%task_id, "Stuck task exhausted retries");
        }
        Ok(())
    }

    /// Whether every task of the ticket in the given task's phase reached a
    /// terminal status.
    async fn phase_tasks_all_terminal(&self, task: &crate::domain::models::Task) -> DomainResult<bool> {
        let siblings = self
            .queue
            .repo()
            .list(TaskFilter {
                ticket_id: Some(task.ticket_id),
                phase_id: Some(task.phase_id.clone()),
                ..Default::default()
            })
            .await?;
        Ok(siblings.iter().all(|t| t.status.is_terminal()))
    }
}

fn seed_from(task_id: Uuid) -> u64 {
    u64::from_le_bytes(task_id.as_bytes()[..8].try_into().unwrap_or_default())
}
