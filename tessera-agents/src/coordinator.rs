//! Distributed coordinator.
//!
//! Shares contexts with agents, keeps their subscriptions, takes in proposed
//! field changes and drives synchronization with conflict detection. Every
//! agent-facing operation runs under the operation timeout; a timed-out
//! operation does not roll back notifications already sent.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tessera_context::StrategyEngine;
use tessera_core::{
    check_field_name, new_entity_id, share_key, with_timeout, AgentCapabilities, AgentId,
    AgentRegistration, AgentStatus, ConflictId, ConflictRecord, ConflictResolution,
    ConflictStatus, Context, ContextEvent, ContextId, ContextMutation, EntityType, ErrorKind,
    EventType, EventTypeFilter, Operation, Permissions, ProposedChange, Resolver, ShareRecord,
    Subscription, SubscriptionId, SyncMode, TesseraError, TesseraResult, Timestamp,
    ValidationError,
};
use tessera_events::{handler_fn, EventBus, EventSelector};
use tessera_storage::{load_prefix, put_json};
use tracing::{debug, info, warn};

use crate::registry::AgentRegistry;
use crate::resolution::{auto_resolve, detect_conflicts, settled_value};
use crate::transport::SharedTransport;

const SHARE_PREFIX: &str = "shares/";

// ============================================================================
// RESULTS
// ============================================================================

/// Outcome of a successful share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareResult {
    pub context_id: ContextId,
    pub shares: Vec<ShareRecord>,
}

impl ShareResult {
    pub fn agents(&self) -> Vec<AgentId> {
        self.shares.iter().map(|s| s.agent_id).collect()
    }
}

/// Per-broadcast delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    /// Matching subscriptions whose agent is not active
    pub skipped: usize,
}

/// Outcome of a synchronization round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub context: Context,
    pub synced_agents: Vec<AgentId>,
    pub failed_agents: Vec<AgentId>,
    /// Conflicts detected and resolved automatically in this round
    pub conflicts: Vec<ConflictRecord>,
}

#[derive(Debug, Default)]
struct ProposalQueue {
    next_sequence: u64,
    pending: Vec<ProposedChange>,
}

// ============================================================================
// COORDINATOR
// ============================================================================

pub struct DistributedCoordinator {
    engine: Arc<StrategyEngine>,
    registry: Arc<AgentRegistry>,
    transport: SharedTransport,
    timeout: Duration,
    shares: DashMap<(ContextId, AgentId), ShareRecord>,
    subscriptions: DashMap<SubscriptionId, Subscription>,
    proposals: DashMap<ContextId, ProposalQueue>,
    conflicts: DashMap<ConflictId, ConflictRecord>,
    /// Manually settled field values waiting for the next synchronization
    resolutions: DashMap<ContextId, BTreeMap<String, Value>>,
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("agents", &self.registry.len())
            .field("shares", &self.shares.len())
            .field("subscriptions", &self.subscriptions.len())
            .field("conflicts", &self.conflicts.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn not_registered(agent_ids: Vec<AgentId>) -> TesseraError {
    TesseraError::AgentNotRegistered { agent_ids }
}

fn capability_violation(agent_id: AgentId, reason: impl Into<String>) -> TesseraError {
    ValidationError::ConstraintViolation {
        constraint: format!("capabilities of agent {}", agent_id),
        reason: reason.into(),
    }
    .into()
}

impl DistributedCoordinator {
    pub fn new(
        engine: Arc<StrategyEngine>,
        registry: Arc<AgentRegistry>,
        transport: SharedTransport,
    ) -> Self {
        let timeout = engine.repository().config().operation_timeout;
        Self {
            engine,
            registry,
            transport,
            timeout,
            shares: DashMap::new(),
            subscriptions: DashMap::new(),
            proposals: DashMap::new(),
            conflicts: DashMap::new(),
            resolutions: DashMap::new(),
        }
    }

    /// Override the deadline applied to every agent-facing operation.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn engine(&self) -> &Arc<StrategyEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn operation_timeout(&self) -> Duration {
        self.timeout
    }

    fn bus(&self) -> &EventBus {
        self.engine.repository().bus()
    }

    // ========================================================================
    // AGENT LIFECYCLE
    // ========================================================================

    pub fn register_agent(
        &self,
        agent_id: AgentId,
        name: impl Into<String>,
        capabilities: AgentCapabilities,
    ) -> TesseraResult<AgentRegistration> {
        self.registry.register(agent_id, name, capabilities)
    }

    /// Remove an agent together with its shares and subscriptions. Contexts
    /// are left untouched.
    pub async fn unregister_agent(&self, agent_id: AgentId) -> TesseraResult<AgentRegistration> {
        with_timeout("unregister_agent", self.timeout, async {
            if !self.registry.is_registered(agent_id) {
                return Err(not_registered(vec![agent_id]));
            }
            for share in self.shares_for_agent(agent_id) {
                self.revoke_share(share.context_id, agent_id).await?;
            }
            self.cancel_subscriptions(agent_id);
            self.registry.remove(agent_id)
        })
        .await
    }

    pub fn heartbeat(&self, agent_id: AgentId) -> TesseraResult<()> {
        self.registry.heartbeat(agent_id)
    }

    /// Mark the agent disconnected and cancel its subscriptions. Shares are
    /// kept so the agent can pick them up again on reconnect. Returns `false`
    /// when the agent was already disconnected.
    pub fn disconnect_agent(&self, agent_id: AgentId) -> TesseraResult<bool> {
        let changed = self.apply_disconnect(agent_id)?;
        if changed {
            self.bus()
                .publish(ContextEvent::for_agent(EventType::AgentDisconnected, agent_id));
        }
        Ok(changed)
    }

    fn apply_disconnect(&self, agent_id: AgentId) -> TesseraResult<bool> {
        let previous = self.registry.set_status(agent_id, AgentStatus::Disconnected)?;
        if previous == AgentStatus::Disconnected {
            return Ok(false);
        }
        let cancelled = self.cancel_subscriptions(agent_id);
        info!(agent_id = %agent_id, cancelled, "agent disconnected");
        Ok(true)
    }

    /// React to `agent-disconnected` events published by anyone on the bus.
    /// The handler holds a weak reference and stops acting once the
    /// coordinator is dropped.
    pub fn listen_for_disconnects(self: &Arc<Self>) -> SubscriptionId {
        let weak = Arc::downgrade(self);
        let selector =
            EventSelector::types(EventTypeFilter::only([EventType::AgentDisconnected]));
        self.bus().subscribe(
            selector,
            handler_fn(move |event: ContextEvent| {
                let weak = weak.clone();
                async move {
                    let (Some(coordinator), Some(agent_id)) = (weak.upgrade(), event.agent_id)
                    else {
                        return Ok(());
                    };
                    match coordinator.apply_disconnect(agent_id) {
                        Ok(_) => Ok(()),
                        Err(e) if e.kind() == ErrorKind::AgentNotRegistered => Ok(()),
                        Err(e) => Err(e),
                    }
                }
            }),
        )
    }

    /// Disconnect every active agent whose heartbeat is older than the
    /// configured timeout.
    pub fn sweep_stale(&self, now: Timestamp) -> Vec<AgentId> {
        let mut swept = Vec::new();
        for agent_id in self.registry.stale_agents(now) {
            match self.disconnect_agent(agent_id) {
                Ok(true) => swept.push(agent_id),
                Ok(false) => {}
                Err(e) => debug!(agent_id = %agent_id, error = %e, "stale agent vanished"),
            }
        }
        if !swept.is_empty() {
            warn!(count = swept.len(), "stale agents disconnected");
        }
        swept
    }

    pub fn reconnect(&self, agent_id: AgentId) -> TesseraResult<AgentRegistration> {
        let registration = self.registry.update(agent_id, |a| {
            a.status = AgentStatus::Active;
            a.last_heartbeat = Utc::now();
            a.clone()
        })?;
        info!(
            agent_id = %agent_id,
            shares = registration.shared_contexts.len(),
            "agent reconnected"
        );
        self.bus()
            .publish(ContextEvent::for_agent(EventType::AgentReconnected, agent_id));
        Ok(registration)
    }

    // ========================================================================
    // SHARING
    // ========================================================================

    /// Share a context with every agent in `target_agents`. Either every
    /// share is recorded or none is.
    pub async fn share_context(
        &self,
        context_id: ContextId,
        target_agents: &[AgentId],
        permissions: Permissions,
        shared_by: Option<AgentId>,
    ) -> TesseraResult<ShareResult> {
        with_timeout(
            "share_context",
            self.timeout,
            self.share_inner(context_id, target_agents, permissions, shared_by),
        )
        .await
    }

    async fn share_inner(
        &self,
        context_id: ContextId,
        target_agents: &[AgentId],
        permissions: Permissions,
        shared_by: Option<AgentId>,
    ) -> TesseraResult<ShareResult> {
        if target_agents.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "target_agents".to_string(),
            }
            .into());
        }
        let missing = self.registry.unregistered(target_agents);
        if !missing.is_empty() {
            return Err(not_registered(missing));
        }
        let context = self.engine.repository().get(context_id).await?;
        if let Some(sharer) = shared_by {
            self.engine
                .isolate()
                .ensure_access(&context, sharer, Operation::Share)?;
        }

        let targets: BTreeSet<AgentId> = target_agents.iter().copied().collect();
        let mut planned = Vec::with_capacity(targets.len());
        for agent_id in targets {
            let agent = self.registry.get(agent_id)?;
            let caps = &agent.capabilities;
            if !caps.can_read {
                return Err(capability_violation(agent_id, "agent cannot read"));
            }
            if !caps.supports(context.context_type) {
                return Err(capability_violation(
                    agent_id,
                    format!("{} contexts not supported", context.context_type),
                ));
            }
            let previous = self.shares.get(&(context_id, agent_id)).map(|s| s.clone());
            if previous.is_none() && !agent.has_capacity() {
                return Err(capability_violation(
                    agent_id,
                    format!(
                        "limit of {} concurrent contexts reached",
                        caps.max_concurrent_contexts
                    ),
                ));
            }
            let granted = caps.cap(permissions);
            if granted.is_empty() {
                return Err(capability_violation(agent_id, "no requested permission is allowed"));
            }
            let mut record = ShareRecord::new(context_id, agent_id, granted, shared_by);
            record.acknowledged_at = previous.as_ref().and_then(|p| p.acknowledged_at);
            planned.push((record, previous));
        }

        let store = self.engine.repository().storage();
        for (done, (record, _)) in planned.iter().enumerate() {
            if let Err(e) = put_json(store.as_ref(), &record.storage_key(), record).await {
                warn!(context_id = %context_id, error = %e, "share failed, rolling back");
                for (written, previous) in &planned[..done] {
                    let undo = match previous {
                        Some(previous) => put_json(store.as_ref(), &written.storage_key(), previous).await,
                        None => store.delete(&written.storage_key()).await,
                    };
                    if let Err(undo_err) = undo {
                        warn!(
                            context_id = %context_id,
                            agent_id = %written.agent_id,
                            error = %undo_err,
                            "share rollback incomplete"
                        );
                    }
                }
                return Err(e);
            }
        }

        let isolate = self.engine.isolate();
        let mut shares = Vec::with_capacity(planned.len());
        for (record, _) in planned {
            isolate.revoke(context_id, record.agent_id);
            isolate.grant(context_id, record.agent_id, record.permissions);
            if let Err(e) = self.registry.record_share(record.agent_id, context_id) {
                debug!(agent_id = %record.agent_id, error = %e, "agent removed during share");
            }
            self.shares.insert((context_id, record.agent_id), record.clone());
            self.bus().publish(
                ContextEvent::for_context(EventType::ContextShared, context_id)
                    .with_agent(record.agent_id)
                    .with_data(json!({ "permissions": record.permissions.bits() })),
            );
            shares.push(record);
        }
        info!(context_id = %context_id, agents = shares.len(), "context shared");
        Ok(ShareResult { context_id, shares })
    }

    pub async fn acknowledge_share(
        &self,
        context_id: ContextId,
        agent_id: AgentId,
    ) -> TesseraResult<ShareRecord> {
        with_timeout("acknowledge_share", self.timeout, async {
            let mut record = self
                .shares
                .get(&(context_id, agent_id))
                .map(|s| s.clone())
                .ok_or_else(|| TesseraError::not_found(EntityType::Share, share_key(context_id, agent_id)))?;
            if record.is_acknowledged() {
                return Ok(record);
            }
            record.acknowledged_at = Some(Utc::now());
            let store = self.engine.repository().storage();
            put_json(store.as_ref(), &record.storage_key(), &record).await?;
            self.shares.insert((context_id, agent_id), record.clone());
            self.bus().publish(
                ContextEvent::for_context(EventType::ShareAcknowledged, context_id)
                    .with_agent(agent_id),
            );
            debug!(context_id = %context_id, agent_id = %agent_id, "share acknowledged");
            Ok(record)
        })
        .await
    }

    pub async fn revoke_share(
        &self,
        context_id: ContextId,
        agent_id: AgentId,
    ) -> TesseraResult<ShareRecord> {
        let key = share_key(context_id, agent_id);
        if !self.shares.contains_key(&(context_id, agent_id)) {
            return Err(TesseraError::not_found(EntityType::Share, key));
        }
        let store = Arc::clone(self.engine.repository().storage());
        with_timeout("revoke_share", self.timeout, store.delete(&key)).await?;
        let (_, record) = self
            .shares
            .remove(&(context_id, agent_id))
            .ok_or_else(|| TesseraError::not_found(EntityType::Share, &key))?;
        self.engine.isolate().revoke(context_id, agent_id);
        self.registry.forget_share(agent_id, context_id);
        self.bus().publish(
            ContextEvent::for_context(EventType::ShareRevoked, context_id).with_agent(agent_id),
        );
        info!(context_id = %context_id, agent_id = %agent_id, "share revoked");
        Ok(record)
    }

    pub fn shares_for_context(&self, context_id: ContextId) -> Vec<ShareRecord> {
        let mut out: Vec<ShareRecord> = self
            .shares
            .iter()
            .filter(|s| s.context_id == context_id)
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.agent_id);
        out
    }

    pub fn shares_for_agent(&self, agent_id: AgentId) -> Vec<ShareRecord> {
        let mut out: Vec<ShareRecord> = self
            .shares
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.context_id);
        out
    }

    /// Rebuild the share table from storage. Returns the number loaded.
    pub async fn load_shares(&self) -> TesseraResult<usize> {
        let store = self.engine.repository().storage();
        let records: Vec<(String, ShareRecord)> = with_timeout(
            "load_shares",
            self.timeout,
            load_prefix(store.as_ref(), SHARE_PREFIX),
        )
        .await?;
        let count = records.len();
        for (_, record) in records {
            self.engine
                .isolate()
                .grant(record.context_id, record.agent_id, record.permissions);
            // Agents register again after a restart; the share outlives them.
            match self.registry.record_share(record.agent_id, record.context_id) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::AgentNotRegistered => {
                    debug!(agent_id = %record.agent_id, context_id = %record.context_id, "share loaded for absent agent");
                }
                Err(e) => {
                    warn!(agent_id = %record.agent_id, context_id = %record.context_id, error = %e, "share not recorded on agent");
                }
            }
            self.shares.insert((record.context_id, record.agent_id), record);
        }
        info!(count, "shares loaded");
        Ok(count)
    }

    // ========================================================================
    // CONTEXT REMOVAL
    // ========================================================================

    /// Delete a context and drop everything held for it here. Returns the
    /// number of shares removed.
    pub async fn delete_context(&self, context_id: ContextId) -> TesseraResult<usize> {
        with_timeout("delete_context", self.timeout, async {
            self.engine.repository().delete(context_id).await?;
            Ok(self.forget_context(context_id).await)
        })
        .await
    }

    /// Drop the shares, context subscriptions, pending proposals, settled
    /// values and conflicts of a context that no longer exists.
    pub async fn forget_context(&self, context_id: ContextId) -> usize {
        let agents: Vec<AgentId> = self
            .shares
            .iter()
            .filter(|s| s.context_id == context_id)
            .map(|s| s.agent_id)
            .collect();
        let store = Arc::clone(self.engine.repository().storage());
        for &agent_id in &agents {
            self.shares.remove(&(context_id, agent_id));
            self.engine.isolate().revoke(context_id, agent_id);
            self.registry.forget_share(agent_id, context_id);
            let key = share_key(context_id, agent_id);
            if let Err(e) = with_timeout("drop_share", self.timeout, store.delete(&key)).await {
                warn!(context_id = %context_id, agent_id = %agent_id, error = %e, "share record left in storage");
            }
        }

        let subscriptions: Vec<(SubscriptionId, AgentId)> = self
            .subscriptions
            .iter()
            .filter(|s| s.context_id == Some(context_id))
            .map(|s| (s.id, s.agent_id))
            .collect();
        for (id, agent_id) in &subscriptions {
            self.subscriptions.remove(id);
            self.registry.forget_subscription(*agent_id, *id);
        }

        let proposals = self
            .proposals
            .remove(&context_id)
            .map(|(_, queue)| queue.pending.len())
            .unwrap_or(0);
        self.resolutions.remove(&context_id);
        let before = self.conflicts.len();
        self.conflicts.retain(|_, c| c.context_id != context_id);

        info!(
            context_id = %context_id,
            shares = agents.len(),
            subscriptions = subscriptions.len(),
            proposals,
            conflicts = before.saturating_sub(self.conflicts.len()),
            "coordination state dropped for context"
        );
        agents.len()
    }

    /// Forget coordination state for contexts deleted by anyone on the bus,
    /// including expiry purges and aborts.
    pub fn listen_for_deletions(self: &Arc<Self>) -> SubscriptionId {
        let weak = Arc::downgrade(self);
        let selector = EventSelector::types(EventTypeFilter::only([EventType::ContextDeleted]));
        self.bus().subscribe(
            selector,
            handler_fn(move |event: ContextEvent| {
                let weak = weak.clone();
                async move {
                    if let (Some(coordinator), Some(context_id)) =
                        (weak.upgrade(), event.context_id)
                    {
                        coordinator.forget_context(context_id).await;
                    }
                    Ok(())
                }
            }),
        )
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Subscribe an agent to events, optionally for one context only. A
    /// context subscription requires read access to it.
    pub async fn subscribe(
        &self,
        agent_id: AgentId,
        context_id: Option<ContextId>,
        filter: EventTypeFilter,
    ) -> TesseraResult<Subscription> {
        if !self.registry.is_registered(agent_id) {
            return Err(not_registered(vec![agent_id]));
        }
        if let Some(context_id) = context_id {
            let context = with_timeout(
                "subscribe",
                self.timeout,
                self.engine.repository().get(context_id),
            )
            .await?;
            self.engine
                .isolate()
                .ensure_access(&context, agent_id, Operation::Read)?;
        }
        let subscription = Subscription {
            id: new_entity_id(),
            agent_id,
            context_id,
            filter,
            created_at: Utc::now(),
        };
        self.registry.record_subscription(agent_id, subscription.id)?;
        self.subscriptions.insert(subscription.id, subscription.clone());
        debug!(agent_id = %agent_id, subscription_id = %subscription.id, "agent subscribed");
        Ok(subscription)
    }

    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> TesseraResult<Subscription> {
        let (_, subscription) = self
            .subscriptions
            .remove(&subscription_id)
            .ok_or_else(|| TesseraError::not_found(EntityType::Subscription, subscription_id))?;
        self.registry
            .forget_subscription(subscription.agent_id, subscription_id);
        Ok(subscription)
    }

    pub fn subscriptions_for(&self, agent_id: AgentId) -> Vec<Subscription> {
        let mut out: Vec<Subscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .map(|s| s.clone())
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    fn cancel_subscriptions(&self, agent_id: AgentId) -> usize {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|s| s.agent_id == agent_id)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.subscriptions.remove(id);
            self.registry.forget_subscription(agent_id, *id);
        }
        ids.len()
    }

    // ========================================================================
    // DELIVERY
    // ========================================================================

    async fn deliver_all(
        &self,
        agents: &[AgentId],
        event: &ContextEvent,
    ) -> Vec<(AgentId, TesseraResult<()>)> {
        let deliveries = agents.iter().map(|&agent_id| {
            let transport = Arc::clone(&self.transport);
            let event = event.clone();
            async move {
                let outcome =
                    with_timeout("deliver", self.timeout, transport.deliver(agent_id, event)).await;
                (agent_id, outcome)
            }
        });
        join_all(deliveries).await
    }

    /// Deliver `update` to every active subscription that matches it. Failed
    /// deliveries are counted, not retried.
    pub async fn broadcast_context_update(
        &self,
        context_id: ContextId,
        update: ContextEvent,
    ) -> TesseraResult<BroadcastReport> {
        let update = update.with_context(context_id);
        let mut report = BroadcastReport::default();
        let mut targets = BTreeSet::new();
        for subscription in self.subscriptions.iter() {
            let scoped = subscription.context_id.map_or(true, |c| c == context_id);
            if !scoped || !subscription.filter.matches(update.event_type) {
                continue;
            }
            let active = self
                .registry
                .get(subscription.agent_id)
                .map(|a| a.is_active())
                .unwrap_or(false);
            if active {
                targets.insert(subscription.agent_id);
            } else {
                report.skipped += 1;
            }
        }
        let targets: Vec<AgentId> = targets.into_iter().collect();

        with_timeout("broadcast_context_update", self.timeout, async {
            for (agent_id, outcome) in self.deliver_all(&targets, &update).await {
                match outcome {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            context_id = %context_id,
                            agent_id = %agent_id,
                            error = %e,
                            "broadcast delivery failed"
                        );
                    }
                }
            }
            Ok(())
        })
        .await?;

        self.bus().publish(update);
        debug!(
            context_id = %context_id,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "broadcast complete"
        );
        Ok(report)
    }

    // ========================================================================
    // PROPOSALS AND SYNCHRONIZATION
    // ========================================================================

    /// Queue a field change for the next synchronization. The proposer must
    /// hold write access; arrival order is recorded in `sequence`.
    pub async fn submit_proposal(
        &self,
        context_id: ContextId,
        mut proposal: ProposedChange,
    ) -> TesseraResult<ProposedChange> {
        if !self.registry.is_registered(proposal.agent_id) {
            return Err(not_registered(vec![proposal.agent_id]));
        }
        check_field_name(&proposal.field)?;
        let context = with_timeout(
            "submit_proposal",
            self.timeout,
            self.engine.repository().get(context_id),
        )
        .await?;
        self.engine
            .isolate()
            .ensure_access(&context, proposal.agent_id, Operation::Write)?;

        let mut queue = self.proposals.entry(context_id).or_default();
        queue.next_sequence += 1;
        proposal.sequence = queue.next_sequence;
        queue.pending.push(proposal.clone());
        debug!(
            context_id = %context_id,
            agent_id = %proposal.agent_id,
            field = %proposal.field,
            sequence = proposal.sequence,
            "proposal queued"
        );
        Ok(proposal)
    }

    pub fn pending_proposals(&self, context_id: ContextId) -> Vec<ProposedChange> {
        self.proposals
            .get(&context_id)
            .map(|q| q.pending.clone())
            .unwrap_or_default()
    }

    /// Detect and resolve conflicts among pending proposals, apply the
    /// outcome as one versioned update, then notify every active agent the
    /// context is shared with.
    ///
    /// Conflicts that need a human fail the round with `UnresolvedConflict`
    /// and leave the context and its proposals untouched.
    pub async fn synchronize_context(&self, context_id: ContextId) -> TesseraResult<SyncResult> {
        with_timeout(
            "synchronize_context",
            self.timeout,
            self.synchronize_inner(context_id),
        )
        .await
    }

    async fn synchronize_inner(&self, context_id: ContextId) -> TesseraResult<SyncResult> {
        let repo = self.engine.repository();
        let context = repo.get(context_id).await?;
        let pending = self.pending_proposals(context_id);
        let isolate = self.engine.isolate();
        let detected = detect_conflicts(&context, &pending, |agent| {
            isolate.check_access(&context, agent, Operation::Write)
        });

        let (manual, automatic): (Vec<ConflictRecord>, Vec<ConflictRecord>) = detected
            .into_iter()
            .partition(|c| c.requires_manual_resolution);
        if !manual.is_empty() {
            let conflicts: Vec<ConflictRecord> =
                manual.into_iter().map(|c| self.escalate(c)).collect();
            warn!(
                context_id = %context_id,
                count = conflicts.len(),
                "synchronization halted on unresolved conflicts"
            );
            return Err(TesseraError::UnresolvedConflict {
                context_id,
                conflicts,
            });
        }

        let clock = repo.config().conflict_clock;
        let mut values: BTreeMap<String, Value> = self
            .resolutions
            .get(&context_id)
            .map(|r| r.clone())
            .unwrap_or_default();
        let consumed_resolutions: Vec<String> = values.keys().cloned().collect();

        let mut by_field: BTreeMap<&str, Vec<ProposedChange>> = BTreeMap::new();
        for proposal in &pending {
            by_field
                .entry(proposal.field.as_str())
                .or_default()
                .push(proposal.clone());
        }
        let mut resolved = Vec::with_capacity(automatic.len());
        for mut conflict in automatic {
            let Some(resolution) = auto_resolve(&conflict, clock) else {
                continue;
            };
            values.insert(conflict.field.clone(), resolution.value.clone());
            conflict.resolve(resolution);
            resolved.push(conflict);
        }
        for (field, group) in &by_field {
            if resolved.iter().any(|c| c.field == *field) {
                continue;
            }
            if let Some(value) = settled_value(group) {
                values.insert((*field).to_string(), value.clone());
            }
        }

        let updated = if values.is_empty() {
            context
        } else {
            let mutation = values
                .into_iter()
                .fold(ContextMutation::new(), |m, (field, value)| m.set_field(field, value));
            repo.update(context_id, &mutation, context.version).await?
        };

        let applied_through = pending.iter().map(|p| p.sequence).max().unwrap_or(0);
        if let Some(mut queue) = self.proposals.get_mut(&context_id) {
            queue.pending.retain(|p| p.sequence > applied_through);
        }
        if let Some(mut settled) = self.resolutions.get_mut(&context_id) {
            for field in &consumed_resolutions {
                settled.remove(field);
            }
        }
        for conflict in &resolved {
            self.conflicts.insert(conflict.id, conflict.clone());
            let data = json!({ "conflict_id": conflict.id, "field": conflict.field });
            self.bus().publish(
                ContextEvent::for_context(EventType::ConflictDetected, context_id)
                    .with_data(data.clone()),
            );
            self.bus().publish(
                ContextEvent::for_context(EventType::ConflictResolved, context_id).with_data(data),
            );
        }

        let targets: Vec<AgentId> = self
            .shares_for_context(context_id)
            .into_iter()
            .map(|s| s.agent_id)
            .filter(|&agent| {
                self.registry
                    .get(agent)
                    .map(|a| a.is_active())
                    .unwrap_or(false)
            })
            .collect();
        let notice = ContextEvent::for_context(EventType::SyncCompleted, context_id).with_data(
            json!({ "version": updated.version, "conflicts": resolved.len() }),
        );
        let mut synced_agents = Vec::new();
        let mut failed_agents = Vec::new();
        let mut first_failure = None;
        for (agent_id, outcome) in self.deliver_all(&targets, &notice).await {
            match outcome {
                Ok(()) => synced_agents.push(agent_id),
                Err(e) => {
                    warn!(
                        context_id = %context_id,
                        agent_id = %agent_id,
                        error = %e,
                        "sync delivery failed"
                    );
                    failed_agents.push(agent_id);
                    first_failure.get_or_insert(e);
                }
            }
        }
        if repo.config().sync_mode == SyncMode::Strong {
            if let Some(e) = first_failure {
                return Err(e);
            }
        }

        self.bus().publish(notice.with_data(json!({
            "version": updated.version,
            "conflicts": resolved.len(),
            "synced": synced_agents.len(),
            "failed": failed_agents.len(),
        })));
        info!(
            context_id = %context_id,
            version = updated.version,
            synced = synced_agents.len(),
            failed = failed_agents.len(),
            conflicts = resolved.len(),
            "context synchronized"
        );
        Ok(SyncResult {
            context: updated,
            synced_agents,
            failed_agents,
            conflicts: resolved,
        })
    }

    /// Store an escalated conflict, reusing the open record for the same
    /// field when there is one.
    fn escalate(&self, mut conflict: ConflictRecord) -> ConflictRecord {
        conflict.escalate();
        let existing = self
            .conflicts
            .iter()
            .find(|c| {
                c.context_id == conflict.context_id
                    && c.field == conflict.field
                    && c.status == ConflictStatus::Escalated
            })
            .map(|c| (c.id, c.detected_at));
        match existing {
            Some((id, detected_at)) => {
                conflict.id = id;
                conflict.detected_at = detected_at;
            }
            None => {
                self.bus().publish(
                    ContextEvent::for_context(EventType::ConflictDetected, conflict.context_id)
                        .with_data(json!({
                            "conflict_id": conflict.id,
                            "field": conflict.field,
                            "conflict_type": conflict.conflict_type.as_str(),
                        })),
                );
            }
        }
        self.conflicts.insert(conflict.id, conflict.clone());
        conflict
    }

    // ========================================================================
    // CONFLICTS
    // ========================================================================

    /// Settle an escalated conflict with `value`. The proposals it covered
    /// are dropped and `value` is applied by the next synchronization.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        value: Value,
        resolved_by: Resolver,
    ) -> TesseraResult<ConflictRecord> {
        let record = self
            .conflicts
            .get(&conflict_id)
            .map(|c| c.clone())
            .ok_or_else(|| TesseraError::not_found(EntityType::Conflict, conflict_id))?;
        if record.is_resolved() {
            return Err(ValidationError::InvalidValue {
                field: "conflict".to_string(),
                reason: format!("{} is already resolved", conflict_id),
            }
            .into());
        }
        if let Resolver::Agent(agent_id) = &resolved_by {
            let context = with_timeout(
                "resolve_conflict",
                self.timeout,
                self.engine.repository().get(record.context_id),
            )
            .await?;
            self.engine
                .isolate()
                .ensure_access(&context, *agent_id, Operation::Write)?;
        }

        let covered = record.proposals.iter().map(|p| p.sequence).max().unwrap_or(0);
        if let Some(mut queue) = self.proposals.get_mut(&record.context_id) {
            queue
                .pending
                .retain(|p| p.field != record.field || p.sequence > covered);
        }
        self.resolutions
            .entry(record.context_id)
            .or_default()
            .insert(record.field.clone(), value.clone());

        let resolution = ConflictResolution::manual(value, resolved_by);
        let resolver = resolution.resolved_by.to_string();
        let updated = {
            let mut entry = self
                .conflicts
                .get_mut(&conflict_id)
                .ok_or_else(|| TesseraError::not_found(EntityType::Conflict, conflict_id))?;
            entry.resolve(resolution);
            entry.clone()
        };
        self.bus().publish(
            ContextEvent::for_context(EventType::ConflictResolved, updated.context_id).with_data(
                json!({ "conflict_id": conflict_id, "field": updated.field, "resolved_by": resolver }),
            ),
        );
        info!(conflict_id = %conflict_id, resolved_by = %resolver, "conflict resolved manually");
        Ok(updated)
    }

    /// Known conflicts, oldest first, optionally for one context.
    pub fn list_conflicts(&self, context_id: Option<ContextId>) -> Vec<ConflictRecord> {
        let mut out: Vec<ConflictRecord> = self
            .conflicts
            .iter()
            .filter(|c| context_id.map_or(true, |id| c.context_id == id))
            .map(|c| c.clone())
            .collect();
        out.sort_by_key(|c| c.detected_at);
        out
    }
}
