//! Tessera Test Utilities
//!
//! Shared test infrastructure for the Tessera workspace:
//! - Proptest generators for contexts, agents and proposals
//! - Fixtures, including a fully wired [`fixtures::TestHarness`]
//! - Assertions on structured errors
//! - Tracing setup for tests

pub use tessera_core::{
    AccessGrant, AgentCapabilities, AgentId, Context, ContextEvent, ContextMetadata, ContextType,
    EngineConfig, ErrorKind, EventType, LifecycleEvent, LifecycleState, Operation, Permissions,
    ProposedChange, Relationship, RelationshipType, TesseraError, TesseraResult, Timestamp,
};

use chrono::Utc;
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a `fmt` subscriber for tests. Honors `RUST_LOG`, defaulting to
/// `tessera=debug`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tessera=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Tessera entity types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};
    use uuid::Uuid;

    // === Identity ===

    pub fn arb_uuid() -> impl Strategy<Value = Uuid> {
        any::<[u8; 16]>().prop_map(Uuid::from_bytes)
    }

    pub fn arb_agent_id() -> impl Strategy<Value = AgentId> {
        arb_uuid()
    }

    /// Timestamps between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    // === Enums ===

    pub fn arb_context_type() -> impl Strategy<Value = ContextType> {
        prop::sample::select(ContextType::all())
    }

    pub fn arb_relationship_type() -> impl Strategy<Value = RelationshipType> {
        prop::sample::select(RelationshipType::all())
    }

    pub fn arb_lifecycle_state() -> impl Strategy<Value = LifecycleState> {
        prop::sample::select(LifecycleState::all())
    }

    pub fn arb_lifecycle_event() -> impl Strategy<Value = LifecycleEvent> {
        prop::sample::select(LifecycleEvent::all())
    }

    pub fn arb_event_type() -> impl Strategy<Value = EventType> {
        prop::sample::select(EventType::all())
    }

    pub fn arb_operation() -> impl Strategy<Value = Operation> {
        prop::sample::select(Operation::all())
    }

    pub fn arb_permissions() -> impl Strategy<Value = Permissions> {
        any::<u8>().prop_map(Permissions::from_bits_truncate)
    }

    // === Content ===

    pub fn arb_tag() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9-]{1,11}"
    }

    pub fn arb_words() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z]{2,9}", 1..12).prop_map(|w| w.join(" "))
    }

    /// Content that passes validation for `context_type`.
    pub fn arb_content(context_type: ContextType) -> BoxedStrategy<Value> {
        match context_type {
            ContextType::Task => arb_words()
                .prop_map(|title| json!({ "title": title }))
                .boxed(),
            ContextType::Conversation => prop::collection::vec(arb_words(), 0..6)
                .prop_map(|messages| json!({ "messages": messages }))
                .boxed(),
            ContextType::Workflow => prop::collection::vec(arb_words(), 0..6)
                .prop_map(|steps| json!({ "steps": steps }))
                .boxed(),
            _ => prop::collection::btree_map("[a-z]{1,8}", arb_words(), 0..5)
                .prop_map(|fields| json!(fields))
                .boxed(),
        }
    }

    pub fn arb_metadata() -> impl Strategy<Value = ContextMetadata> {
        (
            0u8..=10,
            0.0f64..=1.0,
            prop::collection::vec(arb_tag(), 0..4),
        )
            .prop_map(|(priority, relevance, tags)| {
                ContextMetadata::default()
                    .with_priority(priority)
                    .with_relevance(relevance)
                    .with_tags(tags)
            })
    }

    /// A context in state `created`, version 1, that validates.
    pub fn arb_context() -> impl Strategy<Value = Context> {
        arb_context_type().prop_flat_map(|context_type| {
            (arb_content(context_type), arb_metadata())
                .prop_map(move |(content, meta)| Context::new(context_type, content, meta))
        })
    }

    /// A proposal from one of `agents` on one of a few shared field names.
    pub fn arb_proposal(agents: Vec<AgentId>) -> impl Strategy<Value = ProposedChange> {
        (
            prop::sample::select(agents),
            prop::sample::select(vec!["status", "owner", "plan"]),
            prop_oneof![
                arb_words().prop_map(Value::from),
                (0i64..100).prop_map(Value::from),
                prop::collection::btree_map("[a-c]", 0i64..5, 1..3).prop_map(|m| json!(m)),
            ],
        )
            .prop_map(|(agent, field, value)| ProposedChange::new(agent, field, value))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tessera_agents::{AgentRegistry, DistributedCoordinator, MailboxTransport};
    use tessera_context::{ContextRepository, StrategyEngine};
    use tessera_core::new_entity_id;
    use tessera_events::EventBus;
    use tessera_storage::InMemoryStore;

    /// Config with short timeouts so failing tests fail fast.
    pub fn fast_config() -> EngineConfig {
        EngineConfig {
            operation_timeout: Duration::from_secs(2),
            storage_timeout: Duration::from_secs(1),
            ..EngineConfig::default()
        }
    }

    pub fn task_context(title: &str) -> Context {
        Context::new(
            ContextType::Task,
            json!({ "title": title }),
            ContextMetadata::default(),
        )
    }

    pub fn conversation_context(messages: &[&str]) -> Context {
        Context::new(
            ContextType::Conversation,
            json!({ "messages": messages }),
            ContextMetadata::default(),
        )
    }

    pub fn writer_capabilities() -> AgentCapabilities {
        AgentCapabilities::default()
    }

    pub fn sharer_capabilities() -> AgentCapabilities {
        AgentCapabilities {
            can_share: true,
            ..AgentCapabilities::default()
        }
    }

    /// Every component wired over in-memory stores, one bus and a mailbox
    /// transport.
    pub struct TestHarness {
        pub store: InMemoryStore,
        pub archive: InMemoryStore,
        pub bus: EventBus,
        pub repo: Arc<ContextRepository>,
        pub engine: Arc<StrategyEngine>,
        pub registry: Arc<AgentRegistry>,
        pub transport: MailboxTransport,
        pub coordinator: Arc<DistributedCoordinator>,
    }

    impl TestHarness {
        pub fn new() -> Self {
            Self::with_config(fast_config())
        }

        pub fn with_config(config: EngineConfig) -> Self {
            let store = InMemoryStore::new();
            let archive = InMemoryStore::named("archive");
            let bus = EventBus::new(config.event_history_capacity);
            let heartbeat_timeout = config.heartbeat_timeout;
            let repo = Arc::new(ContextRepository::new(
                Arc::new(store.clone()),
                Arc::new(archive.clone()),
                bus.clone(),
                Arc::new(config),
            ));
            let engine = Arc::new(StrategyEngine::new(Arc::clone(&repo)));
            let registry = Arc::new(AgentRegistry::new(bus.clone(), heartbeat_timeout));
            let transport = MailboxTransport::new();
            let coordinator = Arc::new(DistributedCoordinator::new(
                Arc::clone(&engine),
                Arc::clone(&registry),
                Arc::new(transport.clone()),
            ));
            Self {
                store,
                archive,
                bus,
                repo,
                engine,
                registry,
                transport,
                coordinator,
            }
        }

        /// Create and store a context, leaving it `active` at version 1.
        pub async fn active_context(
            &self,
            context_type: ContextType,
            content: Value,
        ) -> TesseraResult<Context> {
            let context = self
                .repo
                .create(context_type, content, ContextMetadata::default());
            self.repo.validate(context.id).await?;
            self.repo.store(context.id).await
        }

        pub async fn active_task(&self, title: &str) -> TesseraResult<Context> {
            self.active_context(ContextType::Task, json!({ "title": title }))
                .await
        }

        pub fn agent(&self, name: &str) -> TesseraResult<AgentId> {
            self.agent_with(name, writer_capabilities())
        }

        pub fn agent_with(&self, name: &str, capabilities: AgentCapabilities) -> TesseraResult<AgentId> {
            let id = new_entity_id();
            self.coordinator.register_agent(id, name, capabilities)?;
            Ok(id)
        }

        /// Event types published so far, oldest first.
        pub fn event_types(&self) -> Vec<EventType> {
            self.bus.history().iter().map(|e| e.event_type).collect()
        }
    }

    impl Default for TestHarness {
        fn default() -> Self {
            Self::new()
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on Tessera results.

    use super::*;

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &TesseraResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that `result` failed with an error of `kind`.
    #[track_caller]
    pub fn assert_error_kind<T: std::fmt::Debug>(result: &TesseraResult<T>, kind: ErrorKind) {
        match result {
            Err(e) => assert_eq!(e.kind(), kind, "Wrong error kind for: {}", e),
            Ok(value) => panic!("Expected {} error, got Ok: {:?}", kind, value),
        }
    }

    #[track_caller]
    pub fn assert_version_conflict<T: std::fmt::Debug>(
        result: &TesseraResult<T>,
        expected: u64,
        actual: u64,
    ) {
        match result {
            Err(TesseraError::VersionConflict {
                expected: e,
                actual: a,
                ..
            }) => {
                assert_eq!((*e, *a), (expected, actual), "Version conflict payload mismatch");
            }
            other => panic!("Expected VersionConflict, got: {:?}", other),
        }
    }

    #[track_caller]
    pub fn assert_state(context: &Context, state: LifecycleState, version: u64) {
        assert_eq!(
            (context.state, context.version),
            (state, version),
            "Context {} in unexpected state",
            context.id
        );
    }

    /// Assert that scores are sorted in descending order.
    #[track_caller]
    pub fn assert_descending(scores: &[f64]) {
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1], "Scores not descending: {:?}", scores);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_task_fixture_validates() {
        let ctx = fixtures::task_context("write docs");
        assert!(ctx.validate(16).is_ok());
        assertions::assert_state(&ctx, LifecycleState::Created, 1);
    }

    #[test]
    fn test_fast_config_is_valid() {
        assert!(fixtures::fast_config().validate().is_ok());
    }

    #[tokio::test]
    async fn test_harness_active_context() {
        let harness = fixtures::TestHarness::new();
        let ctx = harness.active_task("harness").await.unwrap();
        assertions::assert_state(&ctx, LifecycleState::Active, 1);
        assert!(harness.event_types().contains(&EventType::StateChanged));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_generated_contexts_validate(ctx in generators::arb_context()) {
            prop_assert!(ctx.validate(16).is_ok());
        }
    }
}
