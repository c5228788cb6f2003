//! Discovery branching tests: follow-up spawning, allowed_next bypass,
//! priority boost, and dedup.

mod common;

use common::{seed_project, seed_task, seed_task_with, seed_ticket, test_app};
use foreman::domain::models::{DiscoveryKind, Priority, TaskStatus};
use foreman::domain::ports::ClaimFilter;
use uuid::Uuid;

#[tokio::test]
async fn discovery_spawns_follow_up_into_arbitrary_phase() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await; // phase-requirements
    let source = seed_task(&app, &ticket, "investigate parser").await;

    // phase-implementation is NOT in allowed_next(phase-requirements);
    // discovery targets it anyway.
    let discovery = app
        .discovery
        .record_and_branch(
            source.id,
            DiscoveryKind::Bug,
            "Parser drops trailing newline",
            "phase-implementation",
            false,
            vec!["src/parser.rs".to_string()],
        )
        .await
        .unwrap();

    let spawned = app.queue.get(discovery.spawned_task_id).await.unwrap().unwrap();
    assert_eq!(spawned.phase_id, "phase-implementation");
    assert_eq!(spawned.depends_on, vec![source.id]);
    assert_eq!(spawned.estimated_files, vec!["src/parser.rs".to_string()]);
    assert_eq!(spawned.status, TaskStatus::Pending);

    // The follow-up becomes eligible only once the source completes.
    let claimed = app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().unwrap();
    assert_eq!(claimed.id, source.id);
    app.queue.mark_running(source.id, Uuid::new_v4()).await.unwrap();
    app.queue.complete(source.id, serde_json::json!({})).await.unwrap();

    let claimed = app.queue.claim_next("agent", &ClaimFilter::default()).await.unwrap().unwrap();
    assert_eq!(claimed.id, spawned.id);
}

#[tokio::test]
async fn priority_boost_raises_one_level_and_saturates() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;

    let high_source =
        seed_task_with(&app, &ticket, "high source", Priority::High, vec![], vec![]).await;
    let boosted = app
        .discovery
        .record_and_branch(high_source.id, DiscoveryKind::Security, "Token leak", "phase-review", true, vec![])
        .await
        .unwrap();
    let spawned = app.queue.get(boosted.spawned_task_id).await.unwrap().unwrap();
    assert_eq!(spawned.priority, Priority::Critical);

    let critical_source =
        seed_task_with(&app, &ticket, "critical source", Priority::Critical, vec![], vec![]).await;
    let saturated = app
        .discovery
        .record_and_branch(critical_source.id, DiscoveryKind::Bug, "Crash", "phase-review", true, vec![])
        .await
        .unwrap();
    let spawned = app.queue.get(saturated.spawned_task_id).await.unwrap().unwrap();
    assert_eq!(spawned.priority, Priority::Critical);
}

#[tokio::test]
async fn duplicate_discoveries_dedup_within_window() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let source = seed_task(&app, &ticket, "source").await;

    let first = app
        .discovery
        .record_and_branch(source.id, DiscoveryKind::Bug, "Race in   claim path", "phase-review", false, vec![])
        .await
        .unwrap();

    // Same finding, different whitespace/case: suppressed.
    let second = app
        .discovery
        .record_and_branch(source.id, DiscoveryKind::Bug, "race in claim path", "phase-review", false, vec![])
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.spawned_task_id, second.spawned_task_id);

    // A different kind with the same text is a separate discovery.
    let other_kind = app
        .discovery
        .record_and_branch(source.id, DiscoveryKind::Performance, "race in claim path", "phase-review", false, vec![])
        .await
        .unwrap();
    assert_ne!(first.id, other_kind.id);
}

#[tokio::test]
async fn discovery_requires_known_target_phase() {
    let app = test_app().await;
    let project = seed_project(&app, true, 4).await;
    let ticket = seed_ticket(&app, &project).await;
    let source = seed_task(&app, &ticket, "source").await;

    let outcome = app
        .discovery
        .record_and_branch(source.id, DiscoveryKind::Bug, "anything", "phase-unknown", false, vec![])
        .await;
    assert!(outcome.is_err());
}
