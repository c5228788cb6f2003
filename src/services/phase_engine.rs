//! Phase state machine: gate evaluation, ticket transitions, history,
//! and approval suspension.
//!
//! Exactly one process in a deployment may own phase transitions. Other
//! processes publish intents (`phase.approval.granted`,
//! `task.complete.requested`) instead of writing ticket state;
//! [`PhaseEngine::register_handlers`] refuses a second registration so a
//! misconfigured process fails at startup rather than double-writing.

use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    GateEvidence, PhaseDef, PhaseHistoryEntry, Ticket, TicketStatus, TransitionReason,
};
use crate::domain::ports::TicketRepository;

use super::event_bus::EventBus;
use super::events::{Event, EventPayload};
use super::phase_registry::PhaseRegistry;

/// One verifiable gate criterion and its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCheck {
    pub description: String,
    pub satisfied: bool,
    pub detail: Option<String>,
}

/// The full gate evaluation for a ticket's current phase.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub checks: Vec<GateCheck>,
    /// Workspace files matched by expected-output patterns.
    pub matched_artifacts: Vec<String>,
}

impl GateReport {
    pub fn satisfied(&self) -> bool {
        self.checks.iter().all(|c| c.satisfied)
    }

    pub fn failing(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter(|c| !c.satisfied)
            .map(|c| c.description.clone())
            .collect()
    }
}

/// Result of a transition request.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    Transitioned,
    /// Same (ticket, to_phase, reason) as the last recorded transition.
    NoOp,
    /// Gate criteria unsatisfied; the ticket stays put. Not an error.
    GateRejected(GateReport),
    /// Suspended on `phase.approval.requested`; resumes on the granted intent.
    ApprovalPending,
}

#[derive(Clone)]
struct PendingApproval {
    reason: TransitionReason,
    actor_id: String,
}

pub struct PhaseEngine {
    tickets: Arc<dyn TicketRepository>,
    registry: Arc<PhaseRegistry>,
    bus: Arc<EventBus>,
    /// Root under which ticket workspaces live, for artifact checks.
    worktrees_root: PathBuf,
    pending_approvals: Mutex<HashMap<(Uuid, String), PendingApproval>>,
    handlers_registered: AtomicBool,
}

impl PhaseEngine {
    pub fn new(
        tickets: Arc<dyn TicketRepository>,
        registry: Arc<PhaseRegistry>,
        bus: Arc<EventBus>,
        worktrees_root: PathBuf,
    ) -> Self {
        Self {
            tickets,
            registry,
            bus,
            worktrees_root,
            pending_approvals: Mutex::new(HashMap::new()),
            handlers_registered: AtomicBool::new(false),
        }
    }

    /// Move a ticket to `to_phase`.
    ///
    /// Validation: (a) `to_phase` must be in `allowed_next` of the current
    /// phase unless the reason bypasses it, (b) for normal transitions the
    /// gate must pass, (c) entering an approval-gated phase suspends until
    /// the granted intent arrives. Repeating the last recorded transition
    /// is a no-op.
    #[instrument(skip(self), fields(%ticket_id, to = to_phase))]
    pub async fn transition(
        &self,
        ticket_id: Uuid,
        to_phase: &str,
        reason: TransitionReason,
        actor_id: &str,
    ) -> DomainResult<TransitionOutcome> {
        self.transition_inner(ticket_id, to_phase, reason, actor_id, false).await
    }

    async fn transition_inner(
        &self,
        ticket_id: Uuid,
        to_phase: &str,
        reason: TransitionReason,
        actor_id: &str,
        approval_satisfied: bool,
    ) -> DomainResult<TransitionOutcome> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(DomainError::TicketNotFound(ticket_id))?;

        // Idempotence: the same (ticket, to, reason) twice is a no-op.
        if ticket.current_phase == to_phase {
            if let Some(last) = self.tickets.latest_history(ticket_id).await? {
                if last.to_phase == to_phase && last.reason == reason {
                    return Ok(TransitionOutcome::NoOp);
                }
            }
        }

        let current = self.registry.require(ticket.project_id, &ticket.current_phase).await?;
        let target = self.registry.require(ticket.project_id, to_phase).await?;

        if !reason.bypasses_allowed_next() && !current.allowed_next.iter().any(|n| n == to_phase) {
            return Err(DomainError::InvalidStateTransition {
                from: current.id.clone(),
                to: to_phase.to_string(),
            });
        }

        let mut report = GateReport::default();
        if reason == TransitionReason::Normal {
            report = self.evaluate_gate_for(&ticket, &current).await?;
            if !report.satisfied() {
                let failing = report.failing();
                warn!(%ticket_id, ?failing, "Phase gate rejected");
                self.bus
                    .publish(EventPayload::PhaseGateRejected {
                        ticket_id,
                        failing_criteria: failing,
                    })
                    .await;
                return Ok(TransitionOutcome::GateRejected(report));
            }
        }

        if target.config.requires_approval && !approval_satisfied && reason != TransitionReason::Manual {
            let key = (ticket_id, to_phase.to_string());
            self.pending_approvals.lock().await.insert(
                key,
                PendingApproval { reason, actor_id: actor_id.to_string() },
            );
            self.bus
                .publish(EventPayload::PhaseApprovalRequested {
                    ticket_id,
                    to_phase: to_phase.to_string(),
                })
                .await;
            return Ok(TransitionOutcome::ApprovalPending);
        }

        self.complete_transition(ticket, &target, reason, actor_id, report.matched_artifacts)
            .await?;
        Ok(TransitionOutcome::Transitioned)
    }

    async fn complete_transition(
        &self,
        mut ticket: Ticket,
        target: &PhaseDef,
        reason: TransitionReason,
        actor_id: &str,
        artifacts: Vec<String>,
    ) -> DomainResult<()> {
        let from = ticket.current_phase.clone();

        self.tickets
            .append_history(&PhaseHistoryEntry {
                ticket_id: ticket.id,
                from_phase: from.clone(),
                to_phase: target.id.clone(),
                reason,
                actor_id: actor_id.to_string(),
                artifacts,
                created_at: Utc::now(),
            })
            .await?;

        ticket.current_phase = target.id.clone();
        if target.terminal {
            ticket.status = TicketStatus::Done;
        } else if ticket.status == TicketStatus::Backlog {
            ticket.status = TicketStatus::Active;
        }
        ticket.touch();
        self.tickets.update(&ticket).await?;

        info!(ticket_id = %ticket.id, from, to = %target.id, reason = reason.as_str(), "Phase transitioned");
        self.bus
            .publish(EventPayload::PhaseTransitioned {
                ticket_id: ticket.id,
                from,
                to: target.id.clone(),
                reason,
            })
            .await;
        Ok(())
    }

    /// Evaluate the ticket's current-phase gate without side effects.
    pub async fn evaluate_gate(&self, ticket_id: Uuid) -> DomainResult<GateReport> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(DomainError::TicketNotFound(ticket_id))?;
        let phase = self.registry.require(ticket.project_id, &ticket.current_phase).await?;
        self.evaluate_gate_for(&ticket, &phase).await
    }

    async fn evaluate_gate_for(&self, ticket: &Ticket, phase: &PhaseDef) -> DomainResult<GateReport> {
        let mut report = GateReport::default();

        // Done-definitions are opaque strings; satisfaction comes from the
        // latest attached evidence record per definition.
        let evidence = self.tickets.list_evidence(ticket.id, &phase.id).await?;
        for definition in &phase.done_definitions {
            let latest: Option<&GateEvidence> = evidence.iter().find(|e| &e.definition == definition);
            let (satisfied, detail) = match latest {
                Some(e) if e.satisfied => (true, e.evidence_ref.clone()),
                Some(_) => (false, Some("evidence records it unsatisfied".to_string())),
                None => (false, Some("no evidence attached".to_string())),
            };
            report.checks.push(GateCheck {
                description: definition.clone(),
                satisfied,
                detail,
            });
        }

        // Artifact patterns are globbed against the ticket workspace.
        let workspace = self.ticket_workspace(ticket.id);
        for output in &phase.expected_outputs {
            let matches = glob_workspace(&workspace, &output.pattern);
            report.matched_artifacts.extend(matches.iter().cloned());
            if output.required {
                report.checks.push(GateCheck {
                    description: format!("artifact: {}", output.pattern),
                    satisfied: !matches.is_empty(),
                    detail: (!matches.is_empty()).then(|| matches.join(", ")),
                });
            }
        }

        Ok(report)
    }

    /// Attach an evidence record against a done-definition.
    pub async fn record_evidence(
        &self,
        ticket_id: Uuid,
        phase_id: &str,
        definition: &str,
        satisfied: bool,
        evidence_ref: Option<String>,
    ) -> DomainResult<()> {
        self.tickets
            .add_evidence(&GateEvidence {
                ticket_id,
                phase_id: phase_id.to_string(),
                definition: definition.to_string(),
                satisfied,
                evidence_ref,
                recorded_at: Utc::now(),
            })
            .await
    }

    /// Attempt the normal next-phase transition for a ticket. Returns
    /// `None` when the current phase has no outgoing transitions.
    pub async fn try_advance(&self, ticket_id: Uuid, actor_id: &str) -> DomainResult<Option<TransitionOutcome>> {
        let ticket = self
            .tickets
            .get(ticket_id)
            .await?
            .ok_or(DomainError::TicketNotFound(ticket_id))?;
        let current = self.registry.require(ticket.project_id, &ticket.current_phase).await?;

        let Some(next) = current.allowed_next.first().cloned() else {
            return Ok(None);
        };
        let outcome = self
            .transition(ticket_id, &next, TransitionReason::Normal, actor_id)
            .await?;
        Ok(Some(outcome))
    }

    /// Subscribe the approval intent handlers.
    ///
    /// Single-writer: the orchestrator process is the only one allowed to
    /// call this; a second call (same process or a duplicated engine) is a
    /// startup error, never a silent double-write.
    pub async fn register_handlers(self: &Arc<Self>) -> DomainResult<()> {
        if self.handlers_registered.swap(true, Ordering::SeqCst) {
            return Err(DomainError::ValidationFailed(
                "Phase transition handlers are already registered in this process".to_string(),
            ));
        }

        let engine = Arc::clone(self);
        self.bus
            .subscribe(
                "phase.approval.*",
                Arc::new(move |event: Event| {
                    let engine = Arc::clone(&engine);
                    Box::pin(async move {
                        engine.handle_approval_event(event).await;
                    })
                }),
            )
            .await;
        Ok(())
    }

    async fn handle_approval_event(&self, event: Event) {
        match event.payload {
            EventPayload::PhaseApprovalGranted { ticket_id, to_phase, actor } => {
                let pending = self
                    .pending_approvals
                    .lock()
                    .await
                    .remove(&(ticket_id, to_phase.clone()));
                let Some(pending) = pending else {
                    warn!(%ticket_id, to_phase, "Approval granted with no pending transition");
                    return;
                };
                let actor_id = if actor.is_empty() { pending.actor_id } else { actor };
                if let Err(e) = self
                    .transition_inner(ticket_id, &to_phase, pending.reason, &actor_id, true)
                    .await
                {
                    warn!(%ticket_id, to_phase, "Resumed transition failed: {e}");
                }
            }
            EventPayload::PhaseApprovalDenied { ticket_id, to_phase, .. } => {
                self.pending_approvals.lock().await.remove(&(ticket_id, to_phase.clone()));
                info!(%ticket_id, to_phase, "Transition aborted by approval denial");
            }
            _ => {}
        }
    }

    fn ticket_workspace(&self, ticket_id: Uuid) -> PathBuf {
        self.worktrees_root.join(format!("ticket-{ticket_id}"))
    }
}

/// Glob `pattern` relative to `workspace`, returning workspace-relative
/// matches. A missing workspace matches nothing.
fn glob_workspace(workspace: &Path, pattern: &str) -> Vec<String> {
    if !workspace.is_dir() {
        return Vec::new();
    }
    let full = format!("{}/{}", workspace.display(), pattern);
    match glob::glob(&full) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .filter_map(|p| {
                p.strip_prefix(workspace)
                    .map(|rel| rel.display().to_string())
                    .ok()
            })
            .collect(),
        Err(e) => {
            warn!(pattern, "Invalid artifact glob: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_report_satisfaction() {
        let mut report = GateReport::default();
        assert!(report.satisfied(), "empty gate passes trivially");

        report.checks.push(GateCheck {
            description: "tests pass".to_string(),
            satisfied: true,
            detail: None,
        });
        assert!(report.satisfied());

        report.checks.push(GateCheck {
            description: "docs written".to_string(),
            satisfied: false,
            detail: None,
        });
        assert!(!report.satisfied());
        assert_eq!(report.failing(), vec!["docs written".to_string()]);
    }

    #[test]
    fn test_glob_workspace_missing_dir() {
        let missing = Path::new("/nonexistent/workspace/for/foreman");
        assert!(glob_workspace(missing, "*.md").is_empty());
    }

    #[tokio::test]
    async fn test_glob_workspace_matches_relative() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("designs")).await.unwrap();
        tokio::fs::write(dir.path().join("designs/api.md"), "x").await.unwrap();

        let matches = glob_workspace(dir.path(), "designs/*.md");
        assert_eq!(matches, vec!["designs/api.md".to_string()]);
    }
}
