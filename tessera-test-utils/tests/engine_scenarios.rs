//! End-to-end scenarios across the repository, strategy engine and
//! coordinator, driven through the shared test harness.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tessera_core::{
    CompressionAlgorithm, ContextMutation, ErrorKind, EventType, LifecycleState, Permissions,
    ProposedChange, StorageTarget,
};
use tessera_context::SelectionQuery;
use tessera_test_utils::assertions::{assert_descending, assert_error_kind, assert_state, assert_version_conflict};
use tessera_test_utils::fixtures::TestHarness;
use tessera_test_utils::{generators, init_tracing};
use tokio::runtime::Runtime;

// ============================================================================
// LIFECYCLE AND VERSIONING
// ============================================================================

#[tokio::test]
async fn test_create_store_update_stale() {
    init_tracing();
    let h = TestHarness::new();
    let ctx = h.repo.create(
        tessera_core::ContextType::Task,
        json!({ "title": "X" }),
        Default::default(),
    );
    assert_state(&ctx, LifecycleState::Created, 1);

    h.repo.validate(ctx.id).await.unwrap();
    let stored = h.repo.store(ctx.id).await.unwrap();
    assert_state(&stored, LifecycleState::Active, 1);

    let bump = ContextMutation::new().priority(9);
    let updated = h.repo.update(ctx.id, &bump, 1).await.unwrap();
    assert_state(&updated, LifecycleState::Active, 2);
    assert_eq!(updated.metadata.priority, 9);

    let stale = h.repo.update(ctx.id, &bump, 1).await;
    assert_version_conflict(&stale, 1, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_single_winner() {
    init_tracing();
    let h = Arc::new(TestHarness::new());
    let ctx = h.active_task("race").await.unwrap();

    let (id, version) = (ctx.id, ctx.version);
    let mut handles = Vec::new();
    for priority in 0..8u8 {
        let h = Arc::clone(&h);
        handles.push(tokio::spawn(async move {
            h.repo
                .update(id, &ContextMutation::new().priority(priority), version)
                .await
        }));
    }
    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(updated) => {
                winners += 1;
                assert_eq!(updated.version, 2);
            }
            Err(e) => assert_eq!(e.kind(), ErrorKind::VersionConflict),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(h.repo.get(ctx.id).await.unwrap().version, 2);
}

#[tokio::test]
async fn test_invalid_transition_leaves_context_untouched() {
    let h = TestHarness::new();
    let ctx = h.active_task("archive me").await.unwrap();
    h.repo.archive(ctx.id).await.unwrap();

    let result = h
        .repo
        .update(ctx.id, &ContextMutation::new().priority(1), ctx.version)
        .await;
    assert!(result.is_err());
    assert_eq!(h.repo.state(ctx.id).await.unwrap(), LifecycleState::Archived);

    let restored = h.repo.restore(ctx.id).await.unwrap();
    assert_state(&restored, LifecycleState::Active, ctx.version);
}

// ============================================================================
// STRATEGIES
// ============================================================================

#[tokio::test]
async fn test_externalize_compress_select() {
    let h = TestHarness::new();
    let rust = h.active_task("rewrite the parser in rust").await.unwrap();
    h.active_task("plan the offsite").await.unwrap();

    let reference = h
        .engine
        .externalize(rust.id, StorageTarget::Scratchpad, None)
        .await
        .unwrap();
    assert_eq!(h.engine.retrieve(&reference).await.unwrap().content, rust.content);

    let (compressed, stats) = h
        .engine
        .compress_context(rust.id, CompressionAlgorithm::Lossless, rust.version)
        .await
        .unwrap();
    assert_eq!(compressed.version, rust.version + 1);
    assert!(stats.ratio > 0.0);
    let restored = h.engine.decompress_context(rust.id).await.unwrap();
    assert_eq!(restored.content, rust.content);

    let hits = h.engine.select(&SelectionQuery::new().text("rust parser"), 5);
    assert!(hits.len() <= 5);
    assert_eq!(hits[0].context.id, rust.id);
    let scores: Vec<f64> = hits.iter().map(|s| s.score).collect();
    assert_descending(&scores);
}

// ============================================================================
// COORDINATION
// ============================================================================

#[tokio::test]
async fn test_share_ack_sync_two_agents() {
    init_tracing();
    let h = TestHarness::new();
    let ctx = h.active_task("shared plan").await.unwrap();
    let a = h.agent("alpha").unwrap();
    let b = h.agent("beta").unwrap();

    let shared = h
        .coordinator
        .share_context(ctx.id, &[a, b], Permissions::read_write(), None)
        .await
        .unwrap();
    assert_eq!(shared.shares.len(), 2);
    h.coordinator.acknowledge_share(ctx.id, a).await.unwrap();
    h.coordinator.acknowledge_share(ctx.id, b).await.unwrap();

    let result = h.coordinator.synchronize_context(ctx.id).await.unwrap();
    assert!(result.synced_agents.contains(&a));
    assert!(result.synced_agents.contains(&b));
    assert_eq!(result.synced_agents.len(), 2);
    assert!(result.conflicts.is_empty());
    assert!(h.event_types().contains(&EventType::SyncCompleted));
}

#[tokio::test]
async fn test_object_proposals_merge_into_one_conflict() {
    let h = TestHarness::new();
    let ctx = h.active_task("profile").await.unwrap();
    let a = h.agent("alpha").unwrap();
    let b = h.agent("beta").unwrap();
    h.coordinator
        .share_context(ctx.id, &[a, b], Permissions::read_write(), None)
        .await
        .unwrap();

    h.coordinator
        .submit_proposal(ctx.id, ProposedChange::new(a, "profile", json!({ "lang": "rust" })))
        .await
        .unwrap();
    h.coordinator
        .submit_proposal(ctx.id, ProposedChange::new(b, "profile", json!({ "editor": "helix" })))
        .await
        .unwrap();

    let pending = h.coordinator.pending_proposals(ctx.id);
    let current = h.repo.get(ctx.id).await.unwrap();
    let detected = tessera_agents::detect_conflicts(&current, &pending, |_| true);
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].conflict_type, tessera_core::ConflictType::FieldModification);

    let result = h.coordinator.synchronize_context(ctx.id).await.unwrap();
    assert_eq!(result.conflicts.len(), 1);
    assert_eq!(
        result.context.content["profile"],
        json!({ "lang": "rust", "editor": "helix" })
    );
}

#[tokio::test]
async fn test_share_with_unregistered_agents_creates_nothing() {
    let h = TestHarness::new();
    let ctx = h.active_task("secret").await.unwrap();
    let ghosts = vec![tessera_core::new_entity_id(), tessera_core::new_entity_id()];

    let result = h
        .coordinator
        .share_context(ctx.id, &ghosts, Permissions::READ, None)
        .await;
    assert_error_kind(&result, ErrorKind::AgentNotRegistered);
    assert!(h.coordinator.shares_for_context(ctx.id).is_empty());
    assert!(!h.event_types().contains(&EventType::ContextShared));
}

#[tokio::test]
async fn test_disconnect_then_reconnect_keeps_share() {
    let h = TestHarness::new();
    let ctx = h.active_task("long running").await.unwrap();
    let a = h.agent("alpha").unwrap();
    h.coordinator
        .share_context(ctx.id, &[a], Permissions::READ, None)
        .await
        .unwrap();
    h.coordinator
        .subscribe(a, Some(ctx.id), Default::default())
        .await
        .unwrap();

    h.coordinator.disconnect_agent(a).unwrap();
    let report = h
        .coordinator
        .broadcast_context_update(ctx.id, tessera_core::ContextEvent::new(EventType::ContextUpdated))
        .await
        .unwrap();
    assert_eq!(report.delivered, 0);

    h.coordinator.reconnect(a).unwrap();
    assert_eq!(h.coordinator.shares_for_agent(a).len(), 1);
    assert!(h.engine.read_as(ctx.id, a).await.is_ok());
}

// ============================================================================
// PROPERTIES
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Sharing with any set that contains an unregistered agent records nothing.
    #[test]
    fn prop_partial_registration_never_shares(registered in 0usize..4, ghosts in 1usize..4) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let h = TestHarness::new();
            let ctx = h.active_task("atomic").await.unwrap();
            let mut targets: Vec<_> = (0..registered)
                .map(|i| h.agent(&format!("agent-{i}")).unwrap())
                .collect();
            targets.extend((0..ghosts).map(|_| tessera_core::new_entity_id()));

            let result = h
                .coordinator
                .share_context(ctx.id, &targets, Permissions::READ, None)
                .await;
            prop_assert!(result.is_err());
            prop_assert!(h.coordinator.shares_for_context(ctx.id).is_empty());
            Ok(())
        })?;
    }

    /// Stored contexts survive a reload from storage unchanged.
    #[test]
    fn prop_stored_contexts_reload(ctx in generators::arb_context()) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let h = TestHarness::new();
            let created = h.repo.create(ctx.context_type, ctx.content.clone(), ctx.metadata.clone());
            let stored = h.repo.store(created.id).await.unwrap();

            let fresh = TestHarness::new();
            let reloaded = tessera_context::ContextRepository::new(
                Arc::new(h.store.clone()),
                Arc::new(fresh.archive.clone()),
                fresh.bus.clone(),
                Arc::new(tessera_core::EngineConfig::default()),
            );
            prop_assert_eq!(reloaded.load_all().await.unwrap(), 1);
            let back = reloaded.get(stored.id).await.unwrap();
            prop_assert_eq!(back.content, stored.content);
            prop_assert_eq!(back.version, stored.version);
            Ok(())
        })?;
    }
}
