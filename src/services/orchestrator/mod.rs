//! Orchestrator loop: the control heart.
//!
//! N claim workers pull eligible tasks, arrange convergence merges, enforce
//! ownership locks, and spawn sandboxes; a subscriber side reacts to
//! completion, failure, and stuck-agent events; periodic sweeps clear
//! expired locks and overdue joins. Failures are isolated per task: the
//! loop itself never dies with one.

mod event_handling;
mod worker;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::ports::{ClaimFilter, ProjectRepository, TicketRepository};

use super::coordination::CoordinationService;
use super::convergence_merger::ConvergenceMerger;
use super::discovery_service::DiscoveryService;
use super::event_bus::EventBus;
use super::guardian::GuardianMonitor;
use super::lock_manager::LockManager;
use super::phase_engine::PhaseEngine;
use super::retry::RetryPolicy;
use super::sandbox_spawner::SandboxSpawner;
use super::synthesis::SynthesisService;
use super::task_queue::TaskQueue;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Number of concurrent claim workers.
    pub workers: usize,
    /// Idle sleep between claim attempts.
    pub poll_interval: Duration,
    /// Lock/synthesis sweep cadence.
    pub sweep_interval: Duration,
    /// Lease TTL for ownership locks.
    pub lock_ttl: chrono::Duration,
    /// Backoff policy for failed-task requeues and sandbox spawns.
    pub retry: RetryPolicy,
    /// Branch ticket branches derive from.
    pub base_branch: String,
    /// Claim constraints shared by every worker.
    pub claim: ClaimFilter,
    /// Gate claims on heartbeat-advertised capacity. Off in tests and in
    /// deployments without heartbeating runtimes.
    pub enforce_capacity: bool,
    /// Grace given to in-flight tasks at shutdown before cancellation.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(10),
            lock_ttl: chrono::Duration::minutes(30),
            retry: RetryPolicy::default(),
            base_branch: "main".to_string(),
            claim: ClaimFilter::default(),
            enforce_capacity: false,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

pub struct Orchestrator {
    pub(crate) queue: Arc<TaskQueue>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) engine: Arc<PhaseEngine>,
    pub(crate) discovery: Arc<DiscoveryService>,
    pub(crate) coordination: Arc<CoordinationService>,
    pub(crate) synthesis: Arc<SynthesisService>,
    pub(crate) merger: Arc<ConvergenceMerger>,
    pub(crate) spawner: Arc<SandboxSpawner>,
    pub(crate) guardian: Arc<GuardianMonitor>,
    pub(crate) tickets: Arc<dyn TicketRepository>,
    pub(crate) projects: Arc<dyn ProjectRepository>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) config: OrchestratorConfig,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

/// Background tasks owned by a running orchestrator.
pub struct OrchestratorHandle {
    workers: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
    guardian_loop: JoinHandle<()>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TaskQueue>,
        locks: Arc<LockManager>,
        engine: Arc<PhaseEngine>,
        discovery: Arc<DiscoveryService>,
        coordination: Arc<CoordinationService>,
        synthesis: Arc<SynthesisService>,
        merger: Arc<ConvergenceMerger>,
        spawner: Arc<SandboxSpawner>,
        guardian: Arc<GuardianMonitor>,
        tickets: Arc<dyn TicketRepository>,
        projects: Arc<dyn ProjectRepository>,
        bus: Arc<EventBus>,
        config: OrchestratorConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            queue,
            locks,
            engine,
            discovery,
            coordination,
            synthesis,
            merger,
            spawner,
            guardian,
            tickets,
            projects,
            bus,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bring the orchestrator up: drive the bus, register every handler
    /// (this process is the single writer for phase and task state),
    /// reconcile leftover state, then start workers and sweeps.
    pub async fn start(self: &Arc<Self>) -> DomainResult<OrchestratorHandle> {
        self.bus.initialize_sequence_from_store().await;

        self.engine.register_handlers().await?;
        self.synthesis.register_handlers().await;
        self.merger.register_handlers().await;
        self.guardian.register_handlers().await;
        self.register_event_handlers().await;

        let _drive = self.bus.drive().await;
        self.bus.ensure_driven().await?;

        self.reconcile_startup().await?;

        let mut workers = Vec::with_capacity(self.config.workers);
        for index in 0..self.config.workers {
            let orchestrator = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                orchestrator.run_worker(index).await;
            }));
        }

        let sweeper = {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                orchestrator.run_sweeper().await;
            })
        };

        let guardian_loop = {
            let orchestrator = Arc::clone(self);
            tokio::spawn(async move {
                orchestrator.run_guardian().await;
            })
        };

        info!(workers = self.config.workers, "Orchestrator started");
        Ok(OrchestratorHandle { workers, sweeper, guardian_loop })
    }

    /// Stop claiming, give in-flight tasks the grace period, then cancel
    /// the stragglers and release their locks.
    pub async fn shutdown(self: &Arc<Self>, handle: OrchestratorHandle) -> DomainResult<()> {
        info!("Orchestrator shutting down");
        let _ = self.shutdown_tx.send(true);

        tokio::time::sleep(self.config.shutdown_grace).await;

        let leftover = self.queue.repo().list_running().await?;
        for task in leftover {
            warn!(task_id = %task.id, "Cancelling task at shutdown");
            self.queue.cancel(task.id).await?;
            self.locks.release_by_task(task.id).await?;
            if let Some(sandbox_id) = task.sandbox_id {
                self.spawner.terminate(sandbox_id).await.ok();
            }
        }

        for worker in handle.workers {
            worker.abort();
        }
        handle.sweeper.abort();
        handle.guardian_loop.abort();
        Ok(())
    }

    /// Crash recovery: every sandbox recorded live belongs to a dead
    /// process now, so terminate it, return its task to pending, and sweep
    /// expired locks.
    pub async fn reconcile_startup(self: &Arc<Self>) -> DomainResult<()> {
        let stale = self.spawner.list_active().await?;
        for sandbox in &stale {
            self.spawner.terminate(sandbox.id).await.ok();
        }

        let repaired = self.queue.repo().reset_orphaned(&[]).await?;
        let swept = self.locks.sweep_expired(Utc::now()).await?;
        if repaired > 0 || swept > 0 || !stale.is_empty() {
            info!(repaired, swept, stale_sandboxes = stale.len(), "Startup reconciliation");
        }
        Ok(())
    }

    /// Authoritative completion callback from the sandbox runtime. Applies
    /// the transition even when the corresponding event was lost, and
    /// answers with the newly-unblocked task ids.
    pub async fn complete_callback(
        self: &Arc<Self>,
        task_id: Uuid,
        success: bool,
        result: serde_json::Value,
        error_message: Option<String>,
    ) -> DomainResult<Vec<Uuid>> {
        if success {
            let transitioned = self.queue.complete(task_id, result).await?;
            if transitioned {
                let unblocked = self.post_completion(task_id).await?;
                return Ok(unblocked);
            }
            // Duplicate callback: answer from current state, no new events.
            let unblocked = self.queue.repo().find_unblocked_by(task_id).await?;
            return Ok(unblocked.into_iter().map(|t| t.id).collect());
        }

        let reason = error_message.unwrap_or_else(|| "unspecified failure".to_string());
        let transitioned = self.queue.fail(task_id, &reason).await?;
        if transitioned {
            self.post_failure(task_id, &reason).await?;
        }
        Ok(Vec::new())
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        loop {
            interval.tick().await;
            if self.is_shutting_down() {
                break;
            }
            if let Err(e) = self.locks.sweep_expired(Utc::now()).await {
                warn!("Lock sweep failed: {e}");
            }
            if let Err(e) = self.synthesis.sweep_deadlines().await {
                warn!("Synthesis deadline sweep failed: {e}");
            }
        }
    }

    async fn run_guardian(self: Arc<Self>) {
        let cadence = self
            .guardian
            .config()
            .cadence
            .to_std()
            .unwrap_or(Duration::from_secs(60));
        let mut interval = tokio::time::interval(cadence);
        loop {
            interval.tick().await;
            if self.is_shutting_down() {
                break;
            }
            match self.guardian.tick(Utc::now()).await {
                Ok(stuck) => {
                    for agent in stuck {
                        if let Err(e) = self.recover_stuck_task(agent.task_id).await {
                            warn!(task_id = %agent.task_id, "Stuck-task recovery failed: {e}");
                        }
                    }
                }
                Err(e) => warn!("Guardian tick failed: {e}"),
            }
        }
    }

}
