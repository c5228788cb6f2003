//! Guardian monitor: heartbeat tracking, alignment scoring, steering
//! interventions, and stuck-agent detection.
//!
//! Runs on a fixed cadence. Alignment is a cheap heuristic over heartbeat
//! age, action repetition, and token overlap between recent actions and the
//! task description; the agent runtime consumes steering events
//! out-of-band.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::DomainResult;
use crate::domain::models::Task;
use crate::domain::ports::TaskRepository;

use super::event_bus::EventBus;
use super::events::{Event, EventPayload, SteeringKind};

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    /// Monitor cadence.
    pub cadence: Duration,
    /// Alignment score below which a steering intervention is issued.
    pub alignment_threshold: f64,
    /// Heartbeat age that triggers steering.
    pub heartbeat_warn: Duration,
    /// Heartbeat age (3x warn by default) that marks the agent stuck.
    pub heartbeat_stuck: Duration,
    /// Heartbeats older than this stop counting toward advertised capacity.
    pub capacity_window: Duration,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            cadence: Duration::seconds(60),
            alignment_threshold: 0.3,
            heartbeat_warn: Duration::seconds(90),
            heartbeat_stuck: Duration::seconds(270),
            capacity_window: Duration::minutes(5),
        }
    }
}

#[derive(Debug, Clone)]
struct HeartbeatRecord {
    sandbox_id: Option<Uuid>,
    capacity: u32,
    last_seen: DateTime<Utc>,
    recent_actions: Vec<String>,
}

/// A stuck agent observation handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct StuckAgent {
    pub agent_id: String,
    pub task_id: Uuid,
}

pub struct GuardianMonitor {
    tasks: Arc<dyn TaskRepository>,
    bus: Arc<EventBus>,
    config: GuardianConfig,
    heartbeats: RwLock<HashMap<String, HeartbeatRecord>>,
    /// Agents already reported stuck, so one stall emits one event.
    reported_stuck: RwLock<HashSet<String>>,
}

impl GuardianMonitor {
    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    pub fn new(tasks: Arc<dyn TaskRepository>, bus: Arc<EventBus>, config: GuardianConfig) -> Self {
        Self {
            tasks,
            bus,
            config,
            heartbeats: RwLock::new(HashMap::new()),
            reported_stuck: RwLock::new(HashSet::new()),
        }
    }

    /// Subscribe to `agent.heartbeat`.
    pub async fn register_handlers(self: &Arc<Self>) {
        let guardian = Arc::clone(self);
        self.bus
            .subscribe(
                "agent.heartbeat",
                Arc::new(move |event: Event| {
                    let guardian = Arc::clone(&guardian);
                    Box::pin(async move {
                        if let EventPayload::AgentHeartbeat {
                            agent_id,
                            sandbox_id,
                            timestamp,
                            capacity,
                            recent_actions,
                        } = event.payload
                        {
                            guardian
                                .record_heartbeat(&agent_id, sandbox_id, timestamp, capacity, recent_actions)
                                .await;
                        }
                    })
                }),
            )
            .await;
    }

    pub async fn record_heartbeat(
        &self,
        agent_id: &str,
        sandbox_id: Option<Uuid>,
        timestamp: DateTime<Utc>,
        capacity: u32,
        recent_actions: Vec<String>,
    ) {
        self.heartbeats.write().await.insert(
            agent_id.to_string(),
            HeartbeatRecord { sandbox_id, capacity, last_seen: timestamp, recent_actions },
        );
        self.reported_stuck.write().await.remove(agent_id);
    }

    /// Sum of capacities advertised by recently-seen agents. The claim path
    /// compares the global in-flight count against this.
    pub async fn total_advertised_capacity(&self) -> u64 {
        let cutoff = Utc::now() - self.config.capacity_window;
        self.heartbeats
            .read()
            .await
            .values()
            .filter(|r| r.last_seen >= cutoff)
            .map(|r| u64::from(r.capacity))
            .sum()
    }

    /// One monitoring pass over every in-flight task. Returns agents newly
    /// marked stuck so the orchestrator can recover their tasks.
    #[instrument(skip(self))]
    pub async fn tick(&self, now: DateTime<Utc>) -> DomainResult<Vec<StuckAgent>> {
        let running = self.tasks.list_running().await?;
        let heartbeats = self.heartbeats.read().await.clone();
        let mut stuck = Vec::new();

        for task in &running {
            let Some(agent_id) = task.agent_id.clone() else {
                continue;
            };
            let record = heartbeats.get(&agent_id);

            let age = match record {
                Some(r) => now - r.last_seen,
                // Never seen: treat the task's start as the last signal.
                None => now - task.started_at.unwrap_or(task.created_at),
            };

            if age >= self.config.heartbeat_stuck {
                let mut reported = self.reported_stuck.write().await;
                if reported.insert(agent_id.clone()) {
                    warn!(agent_id, task_id = %task.id, age_secs = age.num_seconds(), "Agent stuck");
                    self.bus
                        .publish(EventPayload::AgentStuck { agent_id: agent_id.clone(), task_id: task.id })
                        .await;
                    stuck.push(StuckAgent { agent_id, task_id: task.id });
                }
                continue;
            }

            let score = alignment_score(task, record.map(|r| r.recent_actions.as_slice()).unwrap_or(&[]), age);
            if score < self.config.alignment_threshold || age >= self.config.heartbeat_warn {
                let (kind, message) = steering_for(task, score, age, self.config.heartbeat_warn);
                debug!(agent_id, task_id = %task.id, score, kind = kind.as_str(), "Steering issued");
                self.bus
                    .publish(EventPayload::SteeringIssued { agent_id, kind, message })
                    .await;
            }
        }

        Ok(stuck)
    }

    /// Sandbox the agent last reported from, if known.
    pub async fn sandbox_for_agent(&self, agent_id: &str) -> Option<Uuid> {
        self.heartbeats.read().await.get(agent_id).and_then(|r| r.sandbox_id)
    }
}

/// Alignment heuristic in [0, 1]: freshness of the heartbeat, diversity of
/// recent actions, and overlap between actions and the task description.
fn alignment_score(task: &Task, recent_actions: &[String], age: Duration) -> f64 {
    let freshness = {
        let secs = age.num_seconds().max(0) as f64;
        (1.0 - secs / 300.0).clamp(0.0, 1.0)
    };

    let diversity = if recent_actions.len() < 2 {
        1.0
    } else {
        let distinct: HashSet<&String> = recent_actions.iter().collect();
        distinct.len() as f64 / recent_actions.len() as f64
    };

    let relevance = if recent_actions.is_empty() {
        0.5 // No signal either way.
    } else {
        let description_tokens = tokens(&task.description);
        let action_text = recent_actions.join(" ");
        let action_tokens = tokens(&action_text);
        if description_tokens.is_empty() || action_tokens.is_empty() {
            0.5
        } else {
            let overlap = description_tokens.intersection(&action_tokens).count() as f64;
            (overlap / description_tokens.len().min(action_tokens.len()) as f64).clamp(0.0, 1.0)
        }
    };

    0.4 * freshness + 0.3 * diversity + 0.3 * relevance
}

fn steering_for(task: &Task, score: f64, age: Duration, warn: Duration) -> (SteeringKind, String) {
    if age >= warn {
        (
            SteeringKind::Prioritize,
            format!("No heartbeat for {}s; report progress on the current task", age.num_seconds()),
        )
    } else if score < 0.15 {
        (
            SteeringKind::Stop,
            "Recent activity diverged from the task; stop and reassess".to_string(),
        )
    } else {
        (
            SteeringKind::Refocus,
            format!("Refocus on: {}", first_line(&task.description)),
        )
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with_description(description: &str) -> Task {
        Task::new(Uuid::new_v4(), Uuid::new_v4(), "phase-implementation", description)
    }

    #[test]
    fn test_fresh_relevant_agent_scores_high() {
        let task = task_with_description("Implement the parser for config files");
        let actions = vec![
            "edit parser.rs".to_string(),
            "run parser tests".to_string(),
            "read config loader".to_string(),
        ];
        let score = alignment_score(&task, &actions, Duration::seconds(5));
        assert!(score > 0.6, "score was {score}");
    }

    #[test]
    fn test_repetitive_stale_agent_scores_low() {
        let task = task_with_description("Implement the parser for config files");
        let actions = vec!["sleep".to_string(); 10];
        let score = alignment_score(&task, &actions, Duration::seconds(280));
        assert!(score < 0.3, "score was {score}");
    }

    #[test]
    fn test_no_actions_is_neutral_relevance() {
        let task = task_with_description("Anything at all");
        let score = alignment_score(&task, &[], Duration::seconds(0));
        // freshness 1.0, diversity 1.0, relevance 0.5
        assert!((score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_steering_kind_selection() {
        let task = task_with_description("Fix flaky test");
        let warn = Duration::seconds(90);
        let (kind, _) = steering_for(&task, 0.5, Duration::seconds(120), warn);
        assert_eq!(kind, SteeringKind::Prioritize);
        let (kind, _) = steering_for(&task, 0.1, Duration::seconds(10), warn);
        assert_eq!(kind, SteeringKind::Stop);
        let (kind, _) = steering_for(&task, 0.25, Duration::seconds(10), warn);
        assert_eq!(kind, SteeringKind::Refocus);
    }
}
