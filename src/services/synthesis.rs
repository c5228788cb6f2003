//! Synthesis service: watches join-source completions and folds their
//! results into the continuation task's context.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::{JoinRegistration, JoinStatus, SyncPointStatus};
use crate::domain::ports::JoinRepository;

use super::coordination::merge;
use super::event_bus::EventBus;
use super::events::{Event, EventPayload};
use super::task_queue::TaskQueue;

pub struct SynthesisService {
    joins: Arc<dyn JoinRepository>,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
}

impl SynthesisService {
    pub fn new(joins: Arc<dyn JoinRepository>, queue: Arc<TaskQueue>, bus: Arc<EventBus>) -> Self {
        Self { joins, queue, bus }
    }

    /// Subscribe to `task.completed`. Idempotent per event id because
    /// arrival marking is a set insert and ready joins are skipped.
    pub async fn register_handlers(self: &Arc<Self>) {
        let service = Arc::clone(self);
        self.bus
            .subscribe(
                "task.completed",
                Arc::new(move |event: Event| {
                    let service = Arc::clone(&service);
                    Box::pin(async move {
                        if let EventPayload::TaskCompleted { task_id, .. } = event.payload {
                            if let Err(e) = service.on_source_completed(task_id).await {
                                warn!(%task_id, "Synthesis handling failed: {e}");
                            }
                        }
                    })
                }),
            )
            .await;
    }

    /// Mark `task_id` arrived in every waiting join and sync point that
    /// lists it; fire those that become ready.
    #[instrument(skip(self))]
    pub async fn on_source_completed(&self, task_id: Uuid) -> DomainResult<Vec<JoinRegistration>> {
        let mut fired = Vec::new();

        for mut join in self.joins.find_waiting_with_source(task_id).await? {
            if !join.arrived.insert(task_id) {
                continue; // Duplicate event for a recorded arrival.
            }
            join.updated_at = Utc::now();

            let now = Utc::now();
            if join.is_past_deadline(now) {
                self.fail_join(&mut join, "deadline exceeded before sources arrived").await?;
                continue;
            }

            if join.is_satisfied() {
                self.fire_join(&mut join).await?;
                fired.push(join);
            } else {
                self.joins.update(&join).await?;
            }
        }

        for mut point in self.joins.find_waiting_sync_points_with_source(task_id).await? {
            if !point.arrived.insert(task_id) {
                continue;
            }
            point.updated_at = Utc::now();
            if point.is_satisfied() {
                point.status = SyncPointStatus::Ready;
                info!(name = %point.name, "Sync point ready");
            }
            self.joins.update_sync_point(&point).await?;
        }

        Ok(fired)
    }

    /// Fail joins whose deadline has passed without readiness. Driven by
    /// the orchestrator's periodic sweep.
    pub async fn sweep_deadlines(&self) -> DomainResult<u64> {
        let now = Utc::now();
        let mut failed = 0;
        for mut join in self.joins.list_waiting().await? {
            if join.is_past_deadline(now) {
                self.fail_join(&mut join, "deadline exceeded").await?;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn fire_join(&self, join: &mut JoinRegistration) -> DomainResult<()> {
        // Merge the arrived sources' results in deterministic (set) order.
        let mut source_results: Vec<Value> = Vec::new();
        for source_id in &join.arrived {
            let result = self
                .queue
                .get(*source_id)
                .await?
                .and_then(|t| t.result)
                .unwrap_or(Value::Null);
            source_results.push(result);
        }

        let merged = merge(&source_results, join.strategy);
        self.queue
            .repo()
            .set_synthesis_context(join.continuation_task_id, &merged)
            .await?;

        join.status = JoinStatus::Ready;
        join.updated_at = Utc::now();
        self.joins.update(join).await?;

        info!(
            join_id = %join.id,
            continuation = %join.continuation_task_id,
            strategy = join.strategy.as_str(),
            "Join synthesis completed"
        );
        self.bus
            .publish(EventPayload::SynthesisCompleted {
                continuation_task_id: join.continuation_task_id,
                source_task_ids: join.source_task_ids.iter().copied().collect(),
                ticket_id: join.ticket_id,
            })
            .await;
        Ok(())
    }

    async fn fail_join(&self, join: &mut JoinRegistration, reason: &str) -> DomainResult<()> {
        join.status = JoinStatus::Failed;
        join.updated_at = Utc::now();
        self.joins.update(join).await?;

        warn!(join_id = %join.id, reason, "Join synthesis failed");
        self.bus
            .publish(EventPayload::SynthesisFailed {
                continuation_task_id: join.continuation_task_id,
                ticket_id: join.ticket_id,
                reason: reason.to_string(),
            })
            .await;
        Ok(())
    }
}
