//! Context repository
//!
//! Owns every [`Context`] and its authoritative version counter. Each
//! operation is gated by the lifecycle table before it touches storage.
//!
//! # Concurrency
//!
//! Records live in a sharded [`DashMap`]; there is no lock spanning contexts.
//! Versioned mutations are optimistic: the caller names the version it last
//! saw, the repository reserves the context by moving it into an in-flight
//! state, persists the candidate without holding any guard, then commits.
//! A second writer arriving with the same version is rejected with
//! `VersionConflict`. Lifecycle events for one context are published while
//! that context's shard guard is held, so subscribers observe them in commit
//! order.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tessera_core::{
    archive_key, context_key, next_state, relationship_key, relationship_prefix, with_timeout,
    AgentId, Context, ContextEvent, ContextId, ContextMetadata, ContextMutation, ContextType,
    EngineConfig, EntityType, EventType, LifecycleEvent, LifecycleState, Relationship,
    RelationshipType, StorageLocation, StorageTier, TesseraError, TesseraResult, Timestamp,
    ValidationError,
};
use tessera_events::EventBus;
use tessera_storage::{get_json, load_prefix, put_json, SharedStorage, StorageFilter};
use tracing::{debug, info, warn};

/// Persisted form of one relationship edge, keyed by (source, target, type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub source_id: ContextId,
    pub target_id: ContextId,
    pub relationship_type: RelationshipType,
    pub weight: f64,
}

impl RelationshipRecord {
    pub fn from_edge(source_id: ContextId, edge: &Relationship) -> Self {
        Self {
            source_id,
            target_id: edge.target_id,
            relationship_type: edge.relationship_type,
            weight: edge.weight,
        }
    }

    pub fn storage_key(&self) -> String {
        relationship_key(self.source_id, self.target_id, self.relationship_type)
    }
}

/// Repository of contexts backed by a hot store and an archival store.
pub struct ContextRepository {
    store: SharedStorage,
    archive: SharedStorage,
    bus: EventBus,
    config: Arc<EngineConfig>,
    records: DashMap<ContextId, Context>,
}

impl std::fmt::Debug for ContextRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextRepository")
            .field("store", &self.store.backend_name())
            .field("archive", &self.archive.backend_name())
            .field("records", &self.records.len())
            .finish()
    }
}

fn not_found(id: ContextId) -> TesseraError {
    TesseraError::not_found(EntityType::Context, id)
}

fn rejected(context_id: ContextId, from: LifecycleState, event: LifecycleEvent) -> TesseraError {
    TesseraError::InvalidTransition {
        context_id,
        from,
        event,
    }
}

impl ContextRepository {
    pub fn new(
        store: SharedStorage,
        archive: SharedStorage,
        bus: EventBus,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            archive,
            bus,
            config,
            records: DashMap::new(),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.store
    }

    // ========================================================================
    // CREATION AND READS
    // ========================================================================

    /// Create a context in state `created` at version 1. Nothing is persisted yet.
    pub fn create(
        &self,
        context_type: ContextType,
        content: serde_json::Value,
        metadata: ContextMetadata,
    ) -> Context {
        let context = Context::new(context_type, content, metadata);
        self.records.insert(context.id, context.clone());
        info!(context_id = %context.id, context_type = %context_type, "context created");
        self.bus.publish(
            ContextEvent::for_context(EventType::ContextCreated, context.id)
                .with_data(json!({ "context_type": context_type.as_str() })),
        );
        context
    }

    /// Current snapshot of a live context.
    pub async fn get(&self, id: ContextId) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        match self.records.get(&id) {
            Some(ctx) if ctx.state != LifecycleState::Deleted => Ok(ctx.clone()),
            _ => Err(not_found(id)),
        }
    }

    /// Lifecycle state, including `deleted` for destroyed contexts.
    pub async fn state(&self, id: ContextId) -> TesseraResult<LifecycleState> {
        self.ensure_loaded(id).await?;
        self.records
            .get(&id)
            .map(|ctx| ctx.state)
            .ok_or_else(|| not_found(id))
    }

    /// All live contexts, ordered by id.
    pub fn list(&self) -> Vec<Context> {
        let mut out: Vec<Context> = self
            .records
            .iter()
            .filter(|e| e.state != LifecycleState::Deleted)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    pub fn list_in_state(&self, state: LifecycleState) -> Vec<Context> {
        self.list()
            .into_iter()
            .filter(|c| c.state == state)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records
            .iter()
            .filter(|e| e.state != LifecycleState::Deleted)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hydrate every persisted context not already in memory.
    pub async fn load_all(&self) -> TesseraResult<usize> {
        let rows: Vec<(String, Context)> = self
            .timed("load_contexts", load_prefix(self.store.as_ref(), "contexts/"))
            .await?;
        let mut loaded = 0;
        for (_, ctx) in rows {
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.records.entry(ctx.id) {
                slot.insert(ctx);
                loaded += 1;
            }
        }
        info!(loaded, "hydrated contexts from storage");
        Ok(loaded)
    }

    /// Persisted relationship records leaving `id`.
    pub async fn relationships_of(&self, id: ContextId) -> TesseraResult<Vec<RelationshipRecord>> {
        let rows: Vec<(String, RelationshipRecord)> = self
            .timed(
                "load_relationships",
                load_prefix(self.store.as_ref(), &relationship_prefix(id)),
            )
            .await?;
        Ok(rows.into_iter().map(|(_, r)| r).collect())
    }

    // ========================================================================
    // LIFECYCLE OPERATIONS
    // ========================================================================

    /// created → validating → storing, or → error when the schema check fails.
    pub async fn validate(&self, id: ContextId) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        let ctx = self.transition(id, LifecycleEvent::Validate)?;
        match ctx.validate(self.config.max_relationships) {
            Ok(()) => self.transition(id, LifecycleEvent::Succeed),
            Err(e) => {
                self.transition(id, LifecycleEvent::Fail)?;
                warn!(context_id = %id, error = %e, "context failed validation");
                Err(e.into())
            }
        }
    }

    /// Persist the context and make it active.
    ///
    /// Accepts a context in `created` (validating inline) or one left in
    /// `storing` by [`ContextRepository::validate`].
    pub async fn store(&self, id: ContextId) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        let snapshot = {
            let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
            if entry.state != LifecycleState::Storing {
                let direct = entry.state == LifecycleState::Created;
                self.step(&mut entry, LifecycleEvent::Store)?;
                if direct {
                    if let Err(e) = entry.validate(self.config.max_relationships) {
                        self.step(&mut entry, LifecycleEvent::Fail)?;
                        warn!(context_id = %id, error = %e, "context failed validation");
                        return Err(e.into());
                    }
                }
            }
            entry.clone()
        };

        let mut persisted = snapshot;
        persisted.state = LifecycleState::Active;
        let compressed_key = persisted
            .metadata
            .storage
            .as_ref()
            .and_then(|s| s.compressed_key.clone());
        persisted.metadata.storage = Some(StorageLocation {
            tier: StorageTier::Hot,
            key: context_key(id),
            compressed_key,
        });

        match self.persist(&persisted).await {
            Ok(()) => {
                let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
                entry.metadata.storage = persisted.metadata.storage;
                self.step(&mut entry, LifecycleEvent::Succeed)?;
                info!(context_id = %id, version = entry.version, "context stored");
                Ok(entry.clone())
            }
            Err(e) => {
                self.fail(id, &e);
                Err(e)
            }
        }
    }

    /// Record an access. Counters are bookkeeping and do not bump the version.
    pub async fn access(&self, id: ContextId, agent_id: Option<AgentId>) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
        self.step(&mut entry, LifecycleEvent::Access)?;
        entry.metadata.access_count += 1;
        entry.metadata.last_accessed_at = Utc::now();
        entry.metadata.last_accessed_by = agent_id;
        self.step(&mut entry, LifecycleEvent::Succeed)?;
        let mut event = ContextEvent::for_context(EventType::ContextAccessed, id)
            .with_data(json!({ "access_count": entry.metadata.access_count }));
        if let Some(agent_id) = agent_id {
            event = event.with_agent(agent_id);
        }
        self.bus.publish(event);
        Ok(entry.clone())
    }

    /// Apply a versioned change. Fails with `VersionConflict` when
    /// `expected_version` is stale.
    pub async fn update(
        &self,
        id: ContextId,
        mutation: &ContextMutation,
        expected_version: u64,
    ) -> TesseraResult<Context> {
        if mutation.is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "mutation".to_string(),
                reason: "no changes requested".to_string(),
            }
            .into());
        }
        self.mutate(id, LifecycleEvent::Update, expected_version, |ctx| {
            mutation.apply(ctx)
        })
        .await
    }

    /// Generic optimistic mutation through an in-flight lifecycle phase.
    ///
    /// `event` must be `Update` or `Compress`. `f` runs while the context's
    /// shard guard is held and must not call back into the repository.
    pub async fn mutate<F>(
        &self,
        id: ContextId,
        event: LifecycleEvent,
        expected_version: u64,
        f: F,
    ) -> TesseraResult<Context>
    where
        F: FnOnce(&mut Context) -> Result<(), ValidationError>,
    {
        self.ensure_loaded(id).await?;

        let candidate = {
            let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
            if entry.version != expected_version || entry.state.is_in_flight() {
                return Err(TesseraError::VersionConflict {
                    context_id: id,
                    expected: expected_version,
                    actual: entry.version,
                });
            }
            if !matches!(event, LifecycleEvent::Update | LifecycleEvent::Compress) {
                return Err(rejected(id, entry.state, event));
            }
            next_state(entry.state, event).map_err(|r| rejected(id, r.from, r.event))?;

            let mut candidate = entry.clone();
            f(&mut candidate)?;
            if candidate.id != id {
                return Err(ValidationError::InvalidValue {
                    field: "id".to_string(),
                    reason: "context id is immutable".to_string(),
                }
                .into());
            }
            candidate.validate(self.config.max_relationships)?;

            self.step(&mut entry, event)?;
            candidate.version = expected_version + 1;
            candidate.state = LifecycleState::Active;
            candidate.metadata.updated_at = Utc::now();
            candidate
        };

        match self.persist(&candidate).await {
            Ok(()) => {
                let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
                let in_flight = entry.state;
                *entry = candidate;
                entry.state = in_flight;
                self.step(&mut entry, LifecycleEvent::Succeed)?;
                self.bus.publish(
                    ContextEvent::for_context(EventType::ContextUpdated, id).with_data(json!({
                        "version": entry.version,
                        "event": event.as_str(),
                    })),
                );
                info!(context_id = %id, version = entry.version, event = %event, "context mutated");
                Ok(entry.clone())
            }
            Err(e) => {
                self.fail(id, &e);
                Err(e)
            }
        }
    }

    /// Copy the context into the archival store. active → archiving → archived.
    pub async fn archive(&self, id: ContextId) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        let mut archived = self.transition(id, LifecycleEvent::Archive)?;
        archived.state = LifecycleState::Archived;
        let compressed_key = archived
            .metadata
            .storage
            .as_ref()
            .and_then(|s| s.compressed_key.clone());
        archived.metadata.storage = Some(StorageLocation {
            tier: StorageTier::Archive,
            key: archive_key(id),
            compressed_key,
        });

        let result = self
            .timed("archive_context", async {
                put_json(self.archive.as_ref(), &archive_key(id), &archived).await?;
                put_json(self.store.as_ref(), &context_key(id), &archived).await
            })
            .await;

        match result {
            Ok(()) => {
                let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
                entry.metadata.storage = archived.metadata.storage;
                self.step(&mut entry, LifecycleEvent::Succeed)?;
                self.bus
                    .publish(ContextEvent::for_context(EventType::ContextArchived, id));
                info!(context_id = %id, "context archived");
                Ok(entry.clone())
            }
            Err(e) => {
                self.fail(id, &e);
                Err(e)
            }
        }
    }

    /// Bring an archived context back. archived → restoring → active.
    ///
    /// The context stays in `restoring` while the archived copy is loaded and
    /// written back, so a concurrent delete or restore is rejected.
    pub async fn restore(&self, id: ContextId) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        let reserved = self.transition(id, LifecycleEvent::Restore)?;

        let loaded: TesseraResult<Context> = self
            .timed("load_archive", get_json(self.archive.as_ref(), &archive_key(id)))
            .await;
        let mut restored = match loaded {
            Ok(ctx) => ctx,
            Err(e) => {
                self.fail(id, &e);
                return Err(e);
            }
        };
        restored.state = LifecycleState::Active;
        let compressed_key = restored
            .metadata
            .storage
            .as_ref()
            .and_then(|s| s.compressed_key.clone());
        restored.metadata.storage = Some(StorageLocation {
            tier: StorageTier::Hot,
            key: context_key(id),
            compressed_key,
        });

        if let Err(e) = self.persist(&restored).await {
            let mut archived = reserved;
            archived.state = LifecycleState::Archived;
            if let Err(rewrite) = put_json(self.store.as_ref(), &context_key(id), &archived).await {
                warn!(context_id = %id, error = %rewrite, "hot record not reverted after failed restore");
            }
            self.fail(id, &e);
            return Err(e);
        }
        if let Err(e) = self
            .timed("drop_archive", self.archive.delete(&archive_key(id)))
            .await
        {
            warn!(context_id = %id, error = %e, "archived copy left behind after restore");
        }

        let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
        *entry = restored;
        entry.state = LifecycleState::Restoring;
        self.step(&mut entry, LifecycleEvent::Succeed)?;
        self.bus
            .publish(ContextEvent::for_context(EventType::ContextRestored, id));
        info!(context_id = %id, "context restored");
        Ok(entry.clone())
    }

    /// Destroy a context. Backing records are physically deleted; the id
    /// stays known in state `deleted`.
    pub async fn delete(&self, id: ContextId) -> TesseraResult<()> {
        self.ensure_loaded(id).await?;
        self.transition(id, LifecycleEvent::Delete)?;
        match self.erase(id).await {
            Ok(()) => {
                let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
                self.step(&mut entry, LifecycleEvent::Succeed)?;
                self.bus
                    .publish(ContextEvent::for_context(EventType::ContextDeleted, id));
                info!(context_id = %id, "context deleted");
                Ok(())
            }
            Err(e) => {
                self.fail(id, &e);
                Err(e)
            }
        }
    }

    /// error → created.
    pub async fn retry(&self, id: ContextId) -> TesseraResult<Context> {
        self.ensure_loaded(id).await?;
        self.transition(id, LifecycleEvent::Retry)
    }

    /// error → deleted, erasing whatever reached storage.
    pub async fn abort(&self, id: ContextId) -> TesseraResult<()> {
        let state = self.state(id).await?;
        next_state(state, LifecycleEvent::Abort).map_err(|r| rejected(id, r.from, r.event))?;
        self.erase(id).await?;
        self.transition(id, LifecycleEvent::Abort)?;
        self.bus
            .publish(ContextEvent::for_context(EventType::ContextDeleted, id));
        info!(context_id = %id, "context aborted");
        Ok(())
    }

    /// Delete every active or archived context whose expiry has passed.
    pub async fn purge_expired(&self, now: Timestamp) -> Vec<ContextId> {
        let expired: Vec<ContextId> = self
            .records
            .iter()
            .filter(|e| {
                matches!(e.state, LifecycleState::Active | LifecycleState::Archived)
                    && e.is_expired(now)
            })
            .map(|e| *e.key())
            .collect();

        let mut purged = Vec::with_capacity(expired.len());
        for id in expired {
            match self.delete(id).await {
                Ok(()) => purged.push(id),
                Err(e) => warn!(context_id = %id, error = %e, "failed to purge expired context"),
            }
        }
        if !purged.is_empty() {
            info!(count = purged.len(), "purged expired contexts");
        }
        purged
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn ensure_loaded(&self, id: ContextId) -> TesseraResult<()> {
        if self.records.contains_key(&id) {
            return Ok(());
        }
        let loaded: Context = match self
            .timed("load_context", get_json(self.store.as_ref(), &context_key(id)))
            .await
        {
            Ok(ctx) => ctx,
            Err(TesseraError::NotFound { .. }) => return Err(not_found(id)),
            Err(e) => return Err(e),
        };
        self.records.entry(id).or_insert(loaded);
        debug!(context_id = %id, "hydrated context");
        Ok(())
    }

    async fn timed<T, F>(&self, operation: &str, fut: F) -> TesseraResult<T>
    where
        F: Future<Output = TesseraResult<T>>,
    {
        with_timeout(operation, self.config.storage_timeout, fut).await
    }

    /// Apply one table transition to a locked record and publish it.
    fn step(&self, ctx: &mut Context, event: LifecycleEvent) -> TesseraResult<()> {
        let from = ctx.state;
        ctx.state = next_state(from, event).map_err(|r| rejected(ctx.id, r.from, r.event))?;
        debug!(
            context_id = %ctx.id,
            from = %from,
            to = %ctx.state,
            event = %event,
            version = ctx.version,
            "lifecycle transition"
        );
        self.bus.publish(ContextEvent::transition(
            ctx.id, from, ctx.state, event, ctx.version,
        ));
        Ok(())
    }

    fn transition(&self, id: ContextId, event: LifecycleEvent) -> TesseraResult<Context> {
        let mut entry = self.records.get_mut(&id).ok_or_else(|| not_found(id))?;
        self.step(&mut entry, event)?;
        Ok(entry.clone())
    }

    /// Move an in-flight context to `error` after a storage fault.
    fn fail(&self, id: ContextId, cause: &TesseraError) {
        if let Some(mut entry) = self.records.get_mut(&id) {
            if let Err(e) = self.step(&mut entry, LifecycleEvent::Fail) {
                debug!(context_id = %id, error = %e, "fail transition not applicable");
            }
        }
        warn!(context_id = %id, error = %cause, "context operation failed");
    }

    async fn persist(&self, ctx: &Context) -> TesseraResult<()> {
        self.timed("persist_context", async {
            let store = self.store.as_ref();
            put_json(store, &context_key(ctx.id), ctx).await?;

            let existing = store
                .query(&StorageFilter::prefix(relationship_prefix(ctx.id)))
                .await?;
            let mut wanted = BTreeSet::new();
            for edge in &ctx.relationships {
                let record = RelationshipRecord::from_edge(ctx.id, edge);
                let key = record.storage_key();
                put_json(store, &key, &record).await?;
                wanted.insert(key);
            }
            for key in existing.iter().filter(|k| !wanted.contains(*k)) {
                store.delete(key).await?;
            }
            Ok(())
        })
        .await
    }

    async fn erase(&self, id: ContextId) -> TesseraResult<()> {
        self.timed("erase_context", async {
            let store = self.store.as_ref();
            store.delete(&context_key(id)).await?;
            for prefix in [relationship_prefix(id), format!("compressed/{}/", id)] {
                for key in store.query(&StorageFilter::prefix(prefix)).await? {
                    store.delete(&key).await?;
                }
            }
            self.archive.delete(&archive_key(id)).await
        })
        .await
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tessera_storage::InMemoryStore;

    #[derive(Debug, Clone)]
    enum Op {
        Update { priority: u8, stale: bool },
        Access,
        Archive,
        Restore,
        Fail,
        Heal,
    }

    fn any_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..15, any::<bool>()).prop_map(|(priority, stale)| Op::Update { priority, stale }),
            Just(Op::Access),
            Just(Op::Archive),
            Just(Op::Restore),
            Just(Op::Fail),
            Just(Op::Heal),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(40))]

        #[test]
        fn prop_version_monotonic_and_unchanged_on_failure(ops in proptest::collection::vec(any_op(), 1..25)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let repo = ContextRepository::new(
                    Arc::new(store.clone()),
                    Arc::new(InMemoryStore::new()),
                    EventBus::default(),
                    Arc::new(EngineConfig::default()),
                );
                let ctx = repo.create(ContextType::Task, json!({ "title": "p" }), ContextMetadata::default());
                repo.store(ctx.id).await.unwrap();

                for op in ops {
                    let before = repo.get(ctx.id).await.unwrap();
                    let result = match op {
                        Op::Update { priority, stale } => {
                            let expected = if stale { before.version.saturating_sub(1) } else { before.version };
                            repo.update(ctx.id, &ContextMutation::new().priority(priority), expected)
                                .await
                                .map(|_| ())
                        }
                        Op::Access => repo.access(ctx.id, None).await.map(|_| ()),
                        Op::Archive => repo.archive(ctx.id).await.map(|_| ()),
                        Op::Restore => repo.restore(ctx.id).await.map(|_| ()),
                        Op::Fail => { store.set_available(false); Ok(()) }
                        Op::Heal => {
                            store.set_available(true);
                            if repo.state(ctx.id).await.unwrap() == LifecycleState::Error {
                                repo.retry(ctx.id).await.unwrap();
                                repo.store(ctx.id).await.map(|_| ())
                            } else {
                                Ok(())
                            }
                        }
                    };
                    let after = repo.get(ctx.id).await.unwrap();
                    prop_assert!(after.version >= before.version);
                    if result.is_err() {
                        prop_assert_eq!(after.version, before.version);
                    }
                    if let Op::Update { .. } = op {
                        if result.is_ok() {
                            prop_assert_eq!(after.version, before.version + 1);
                        }
                    }
                }
                Ok(())
            })?;
        }
    }
}
