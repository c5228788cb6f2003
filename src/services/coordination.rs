//! Coordination primitives: split, sync points, join registration, and the
//! pure payload merge.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{JoinRegistration, MergeStrategy, SyncPoint, Task};
use crate::domain::ports::JoinRepository;

use super::task_queue::TaskQueue;

pub struct CoordinationService {
    joins: Arc<dyn JoinRepository>,
    queue: Arc<TaskQueue>,
}

impl CoordinationService {
    pub fn new(joins: Arc<dyn JoinRepository>, queue: Arc<TaskQueue>) -> Self {
        Self { joins, queue }
    }

    /// Fan a parent task out into children, each depending on the parent.
    /// Children are enqueued through the queue (DAG-validated, events
    /// published) and returned in input order.
    #[instrument(skip(self, children), fields(parent = %parent_task.id))]
    pub async fn split(&self, parent_task: &Task, children: Vec<Task>) -> DomainResult<Vec<Task>> {
        let mut spawned = Vec::with_capacity(children.len());
        for child in children {
            let child = child.with_dependency(parent_task.id);
            spawned.push(self.queue.enqueue(child).await?);
        }
        info!(count = spawned.len(), "Split parent into children");
        Ok(spawned)
    }

    /// Register a named gate that becomes ready once `required_count`
    /// sources complete, or times out at `deadline`.
    pub async fn sync_point(
        &self,
        name: &str,
        source_task_ids: Vec<Uuid>,
        required_count: usize,
        deadline: Option<DateTime<Utc>>,
    ) -> DomainResult<SyncPoint> {
        if source_task_ids.is_empty() {
            return Err(DomainError::ValidationFailed("Sync point needs at least one source".to_string()));
        }
        let point = SyncPoint::new(name, source_task_ids, required_count, deadline);
        self.joins.create_sync_point(&point).await?;
        Ok(point)
    }

    /// Record that the continuation task's context must be synthesized from
    /// the sources. Validates the invariant sources ⊆ continuation deps.
    /// A `required_count` below the source count makes the join fire early;
    /// the deadline governs the stragglers.
    #[instrument(skip(self, source_task_ids), fields(continuation = %continuation_task_id))]
    pub async fn register_join(
        &self,
        source_task_ids: Vec<Uuid>,
        continuation_task_id: Uuid,
        strategy: MergeStrategy,
        required_count: Option<usize>,
        deadline: Option<DateTime<Utc>>,
    ) -> DomainResult<JoinRegistration> {
        let continuation = self
            .queue
            .get(continuation_task_id)
            .await?
            .ok_or(DomainError::TaskNotFound(continuation_task_id))?;

        let deps: BTreeSet<Uuid> = continuation.depends_on.iter().copied().collect();
        for source in &source_task_ids {
            if !deps.contains(source) {
                return Err(DomainError::ValidationFailed(format!(
                    "Join source {source} is not a dependency of continuation {continuation_task_id}"
                )));
            }
        }

        let mut join = JoinRegistration::new(
            continuation.ticket_id,
            source_task_ids,
            continuation_task_id,
            strategy,
        );
        if let Some(count) = required_count {
            join = join.with_required_count(count);
        }
        if let Some(deadline) = deadline {
            join = join.with_deadline(deadline);
        }
        self.joins.create(&join).await?;
        info!(join_id = %join.id, sources = join.source_task_ids.len(), "Join registered");
        Ok(join)
    }

    /// Auto-register a `combine` join for a multi-dependency task that has
    /// none. Returns the existing or fresh registration; `None` for tasks
    /// with fewer than two dependencies.
    pub async fn ensure_join(&self, task: &Task) -> DomainResult<Option<JoinRegistration>> {
        if task.depends_on.len() < 2 {
            return Ok(None);
        }
        if let Some(existing) = self.joins.get_by_continuation(task.id).await? {
            return Ok(Some(existing));
        }
        let join = self
            .register_join(task.depends_on.clone(), task.id, MergeStrategy::Combine, None, None)
            .await?;
        Ok(Some(join))
    }

    pub async fn get_join(&self, id: Uuid) -> DomainResult<Option<JoinRegistration>> {
        self.joins.get(id).await
    }

    pub async fn get_sync_point(&self, name: &str) -> DomainResult<Option<SyncPoint>> {
        self.joins.get_sync_point(name).await
    }

    /// Durable merge log for a join, oldest first.
    pub async fn list_merge_attempts(&self, join_id: Uuid) -> DomainResult<Vec<crate::domain::models::MergeAttempt>> {
        self.joins.list_merge_attempts(join_id).await
    }
}

/// Pure combine over source payloads.
///
/// - `combine`: shallow-merge objects (later sources win per key),
///   concatenate arrays, otherwise collect into an array.
/// - `union`: set union over array elements (dedup by JSON equality).
/// - `intersection`: elements present in every source array.
/// - `majority`: values kept when they appear in more than half the sources.
pub fn merge(values: &[Value], strategy: MergeStrategy) -> Value {
    match strategy {
        MergeStrategy::Combine => merge_combine(values),
        MergeStrategy::Union => Value::Array(dedup(flatten(values))),
        MergeStrategy::Intersection => merge_intersection(values),
        MergeStrategy::Majority => merge_majority(values),
    }
}

fn merge_combine(values: &[Value]) -> Value {
    if values.iter().all(Value::is_object) {
        let mut merged = Map::new();
        for value in values {
            if let Value::Object(map) = value {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        return Value::Object(merged);
    }
    if values.iter().all(Value::is_array) {
        return Value::Array(flatten(values));
    }
    Value::Array(values.to_vec())
}

fn merge_intersection(values: &[Value]) -> Value {
    let sets: Vec<Vec<Value>> = values.iter().map(as_elements).collect();
    let Some((first, rest)) = sets.split_first() else {
        return Value::Array(Vec::new());
    };
    let intersection: Vec<Value> = dedup(first.clone())
        .into_iter()
        .filter(|candidate| rest.iter().all(|set| set.contains(candidate)))
        .collect();
    Value::Array(intersection)
}

fn merge_majority(values: &[Value]) -> Value {
    let threshold = values.len() / 2 + 1;
    let elements = flatten(values);
    let mut kept: Vec<Value> = Vec::new();
    for candidate in dedup(elements.clone()) {
        let count = elements.iter().filter(|v| **v == candidate).count();
        if count >= threshold {
            kept.push(candidate);
        }
    }
    Value::Array(kept)
}

fn as_elements(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn flatten(values: &[Value]) -> Vec<Value> {
    values.iter().flat_map(as_elements).collect()
}

fn dedup(items: Vec<Value>) -> Vec<Value> {
    let mut seen: Vec<Value> = Vec::new();
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_combine_shallow_merges_maps() {
        let merged = merge(
            &[json!({"a": 1, "shared": "first"}), json!({"b": 2, "shared": "second"})],
            MergeStrategy::Combine,
        );
        assert_eq!(merged, json!({"a": 1, "b": 2, "shared": "second"}));
    }

    #[test]
    fn test_combine_concatenates_lists() {
        let merged = merge(&[json!([1, 2]), json!([3])], MergeStrategy::Combine);
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn test_combine_mixed_collects() {
        let merged = merge(&[json!({"a": 1}), json!([2])], MergeStrategy::Combine);
        assert_eq!(merged, json!([{"a": 1}, [2]]));
    }

    #[test]
    fn test_union_dedups() {
        let merged = merge(&[json!([1, 2]), json!([2, 3])], MergeStrategy::Union);
        assert_eq!(merged, json!([1, 2, 3]));
    }

    #[test]
    fn test_intersection() {
        let merged = merge(&[json!([1, 2, 3]), json!([2, 3, 4]), json!([3, 2])], MergeStrategy::Intersection);
        assert_eq!(merged, json!([2, 3]));
    }

    #[test]
    fn test_majority() {
        let merged = merge(
            &[json!(["x", "y"]), json!(["x", "z"]), json!(["x"])],
            MergeStrategy::Majority,
        );
        assert_eq!(merged, json!(["x"]));
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(merge(&[], MergeStrategy::Union), json!([]));
        assert_eq!(merge(&[], MergeStrategy::Intersection), json!([]));
    }
}
