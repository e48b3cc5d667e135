//! Strategy engine façade.
//!
//! Composes the write, select, compress and isolate strategies over a shared
//! [`ContextRepository`]. Every operation that changes a context goes through
//! the repository so the lifecycle gate and version counter stay authoritative.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    compressed_key, new_entity_id, with_timeout, AgentId, BoundaryId, CompressionAlgorithm,
    CompressionLevel, Context, ContextEvent, ContextId, ContextMutation, EntityType, EventType,
    LifecycleEvent, LifecycleState, Operation, StorageTarget, TesseraError, TesseraResult,
};
use tracing::{info, warn};

use crate::repository::ContextRepository;
use crate::strategy::{
    CompressStrategy, CompressedContext, CompressionStats, ContextReference, FieldProjection,
    IsolateStrategy, MultiCriteriaWeights, PartialContext, RelevanceScorer, ScoredContext,
    SelectStrategy, SelectionQuery, WriteStrategy,
};

pub struct StrategyEngine {
    repo: Arc<ContextRepository>,
    write: WriteStrategy,
    select: SelectStrategy,
    compress: CompressStrategy,
    isolate: Arc<IsolateStrategy>,
}

impl std::fmt::Debug for StrategyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyEngine")
            .field("repo", &self.repo)
            .field("select", &self.select)
            .field("compress", &self.compress)
            .finish()
    }
}

impl StrategyEngine {
    /// Build every strategy from the repository's configuration.
    pub fn new(repo: Arc<ContextRepository>) -> Self {
        let config = repo.config();
        let write = WriteStrategy::new(Arc::clone(repo.storage()), config.reference_ttl);
        let select = SelectStrategy::new(config.selection_weights, config.recency_half_life);
        let compress = CompressStrategy::new(config.semantic_limits);
        Self {
            repo,
            write,
            select,
            compress,
            isolate: Arc::new(IsolateStrategy::default()),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.select = self.select.with_scorer(scorer);
        self
    }

    pub fn with_isolate(mut self, isolate: Arc<IsolateStrategy>) -> Self {
        self.isolate = isolate;
        self
    }

    pub fn repository(&self) -> &Arc<ContextRepository> {
        &self.repo
    }

    pub fn isolate(&self) -> &Arc<IsolateStrategy> {
        &self.isolate
    }

    pub fn write_strategy(&self) -> &WriteStrategy {
        &self.write
    }

    pub fn select_strategy(&self) -> &SelectStrategy {
        &self.select
    }

    pub fn compress_strategy(&self) -> &CompressStrategy {
        &self.compress
    }

    fn storage_timeout(&self) -> Duration {
        self.repo.config().storage_timeout
    }

    // ========================================================================
    // WRITE
    // ========================================================================

    pub async fn externalize(
        &self,
        id: ContextId,
        target: StorageTarget,
        ttl: Option<Duration>,
    ) -> TesseraResult<ContextReference> {
        let context = self.repo.get(id).await?;
        let reference = with_timeout(
            "externalize",
            self.storage_timeout(),
            self.write.store_external(&context, target, ttl),
        )
        .await?;
        self.repo.bus().publish(
            ContextEvent::for_context(EventType::ContextExternalized, id).with_data(json!({
                "key": reference.key,
                "target": target.namespace(),
                "version": reference.version,
            })),
        );
        Ok(reference)
    }

    pub async fn retrieve(&self, reference: &ContextReference) -> TesseraResult<Context> {
        with_timeout(
            "retrieve_external",
            self.storage_timeout(),
            self.write.retrieve_external(reference),
        )
        .await
    }

    // ========================================================================
    // SELECT
    // ========================================================================

    /// Rank active contexts against `query`.
    pub fn select(&self, query: &SelectionQuery, k: usize) -> Vec<ScoredContext> {
        let candidates = self.repo.list_in_state(LifecycleState::Active);
        self.select.select_top_k(&candidates, query, k)
    }

    /// Like [`StrategyEngine::select`], restricted to contexts `agent_id` may read.
    pub fn select_for_agent(
        &self,
        agent_id: AgentId,
        query: &SelectionQuery,
        k: usize,
    ) -> Vec<ScoredContext> {
        let candidates: Vec<Context> = self
            .repo
            .list_in_state(LifecycleState::Active)
            .into_iter()
            .filter(|c| self.isolate.check_access(c, agent_id, Operation::Read))
            .collect();
        self.select.select_top_k(&candidates, query, k)
    }

    pub fn select_multi(
        &self,
        query: &SelectionQuery,
        weights: MultiCriteriaWeights,
        k: usize,
    ) -> Vec<ScoredContext> {
        let candidates = self.repo.list_in_state(LifecycleState::Active);
        self.select.select_multi(&candidates, query, weights, k)
    }

    // ========================================================================
    // COMPRESS
    // ========================================================================

    /// Compress a context, persist the blob and record it on the context.
    ///
    /// The blob is keyed by the version it captured plus a per-attempt id.
    /// Recording it is a versioned mutation, so the context ends at
    /// `expected_version + 1`. A losing attempt only removes its own blob.
    pub async fn compress_context(
        &self,
        id: ContextId,
        algorithm: CompressionAlgorithm,
        expected_version: u64,
    ) -> TesseraResult<(Context, CompressionStats)> {
        let context = self.repo.get(id).await?;
        if context.version != expected_version {
            return Err(TesseraError::VersionConflict {
                context_id: id,
                expected: expected_version,
                actual: context.version,
            });
        }
        let compressed = self.compress.compress(&context, algorithm)?;
        let blob = CompressStrategy::encode(&compressed)?;
        let key = compressed_key(id, expected_version, new_entity_id());
        let previous_key = context
            .metadata
            .storage
            .as_ref()
            .and_then(|s| s.compressed_key.clone());
        let store = Arc::clone(self.repo.storage());
        with_timeout("store_compressed", self.storage_timeout(), store.put(&key, blob)).await?;

        let recorded_key = key.clone();
        let result = self
            .repo
            .mutate(id, LifecycleEvent::Compress, expected_version, move |ctx| {
                ctx.metadata.compression_level = algorithm.level();
                if let Some(location) = ctx.metadata.storage.as_mut() {
                    location.compressed_key = Some(recorded_key);
                }
                Ok(())
            })
            .await;

        match result {
            Ok(updated) => {
                let stats = compressed.stats;
                self.repo.bus().publish(
                    ContextEvent::for_context(EventType::ContextCompressed, id).with_data(json!({
                        "algorithm": algorithm.as_str(),
                        "key": key,
                        "original_size": stats.original_size,
                        "compressed_size": stats.compressed_size,
                        "ratio": stats.ratio,
                        "quality_impact": stats.quality_impact,
                    })),
                );
                info!(context_id = %id, algorithm = %algorithm, ratio = stats.ratio, "context compressed");
                if let Some(previous) = previous_key.filter(|p| *p != key) {
                    if let Err(e) = store.delete(&previous).await {
                        warn!(context_id = %id, key = %previous, error = %e, "stale compressed blob left behind");
                    }
                }
                Ok((updated, stats))
            }
            Err(e) => {
                if let Err(cleanup) = store.delete(&key).await {
                    warn!(context_id = %id, key = %key, error = %cleanup, "orphaned compressed blob");
                }
                Err(e)
            }
        }
    }

    /// The compressed blob recorded on a context.
    pub async fn load_compressed(&self, id: ContextId) -> TesseraResult<CompressedContext> {
        let context = self.repo.get(id).await?;
        let key = context
            .metadata
            .storage
            .and_then(|s| s.compressed_key)
            .filter(|_| context.metadata.compression_level != CompressionLevel::None)
            .ok_or_else(|| TesseraError::not_found(EntityType::Blob, id))?;
        let bytes = with_timeout(
            "load_compressed",
            self.storage_timeout(),
            self.repo.storage().get(&key),
        )
        .await?;
        CompressStrategy::decode(&bytes)
    }

    pub async fn decompress_context(&self, id: ContextId) -> TesseraResult<Context> {
        let compressed = self.load_compressed(id).await?;
        self.compress.decompress(&compressed)
    }

    // ========================================================================
    // ISOLATE
    // ========================================================================

    /// Place a context inside a boundary. Replaces any previous boundary.
    pub async fn assign_boundary(
        &self,
        id: ContextId,
        boundary_id: BoundaryId,
        expected_version: u64,
    ) -> TesseraResult<Context> {
        self.isolate.get_boundary(boundary_id)?;
        let updated = self
            .repo
            .mutate(id, LifecycleEvent::Update, expected_version, |ctx| {
                ctx.metadata.boundary_id = Some(boundary_id);
                Ok(())
            })
            .await?;
        self.repo.bus().publish(
            ContextEvent::for_context(EventType::BoundaryAssigned, id)
                .with_data(json!({ "boundary_id": boundary_id.to_string() })),
        );
        Ok(updated)
    }

    pub async fn clear_boundary(&self, id: ContextId, expected_version: u64) -> TesseraResult<Context> {
        self.repo
            .mutate(id, LifecycleEvent::Update, expected_version, |ctx| {
                ctx.metadata.boundary_id = None;
                Ok(())
            })
            .await
    }

    pub async fn check_access(
        &self,
        id: ContextId,
        agent_id: AgentId,
        operation: Operation,
    ) -> TesseraResult<bool> {
        let context = self.repo.get(id).await?;
        Ok(self
            .isolate
            .evaluate(&context, agent_id, operation, Utc::now())
            .allowed)
    }

    /// Projected view for an agent holding read access.
    pub async fn view(
        &self,
        id: ContextId,
        agent_id: AgentId,
        projection: &FieldProjection,
    ) -> TesseraResult<PartialContext> {
        let context = self.repo.get(id).await?;
        self.isolate.ensure_access(&context, agent_id, Operation::Read)?;
        self.isolate.view(&context, projection)
    }

    /// Read on behalf of an agent, recording the access.
    pub async fn read_as(&self, id: ContextId, agent_id: AgentId) -> TesseraResult<Context> {
        let context = self.repo.get(id).await?;
        self.isolate.ensure_access(&context, agent_id, Operation::Read)?;
        self.repo.access(id, Some(agent_id)).await
    }

    /// Versioned update on behalf of an agent holding write access.
    pub async fn update_as(
        &self,
        id: ContextId,
        agent_id: AgentId,
        mutation: &ContextMutation,
        expected_version: u64,
    ) -> TesseraResult<Context> {
        let context = self.repo.get(id).await?;
        self.isolate.ensure_access(&context, agent_id, Operation::Write)?;
        self.repo.update(id, mutation, expected_version).await
    }
}
