//! Agent registry.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::collections::BTreeSet;
use std::time::Duration;
use tessera_core::{
    AgentCapabilities, AgentId, AgentRegistration, AgentStatus, ContextEvent, ContextId,
    EntityType, EventType, SubscriptionId, TesseraError, TesseraResult, Timestamp,
};
use tessera_events::EventBus;
use tracing::{debug, info};

/// Registered agents keyed by id. Read-mostly; each registration is
/// updated under its own shard guard.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentRegistration>,
    bus: EventBus,
    heartbeat_timeout: Duration,
}

fn not_registered(agent_id: AgentId) -> TesseraError {
    TesseraError::AgentNotRegistered {
        agent_ids: vec![agent_id],
    }
}

impl AgentRegistry {
    pub fn new(bus: EventBus, heartbeat_timeout: Duration) -> Self {
        Self {
            agents: DashMap::new(),
            bus,
            heartbeat_timeout,
        }
    }

    pub fn register(
        &self,
        agent_id: AgentId,
        name: impl Into<String>,
        capabilities: AgentCapabilities,
    ) -> TesseraResult<AgentRegistration> {
        use dashmap::mapref::entry::Entry;
        let registration = match self.agents.entry(agent_id) {
            Entry::Occupied(_) => return Err(TesseraError::AgentAlreadyRegistered { agent_id }),
            Entry::Vacant(slot) => slot
                .insert(AgentRegistration::new(agent_id, name, capabilities))
                .clone(),
        };
        info!(agent_id = %agent_id, name = %registration.name, "agent registered");
        self.bus.publish(
            ContextEvent::for_agent(EventType::AgentRegistered, agent_id)
                .with_data(json!({ "name": registration.name })),
        );
        Ok(registration)
    }

    /// Drop the registration. Cascading cleanup is the caller's job.
    pub fn remove(&self, agent_id: AgentId) -> TesseraResult<AgentRegistration> {
        let (_, registration) = self
            .agents
            .remove(&agent_id)
            .ok_or_else(|| not_registered(agent_id))?;
        self.bus
            .publish(ContextEvent::for_agent(EventType::AgentUnregistered, agent_id));
        info!(agent_id = %agent_id, "agent unregistered");
        Ok(registration)
    }

    pub fn get(&self, agent_id: AgentId) -> TesseraResult<AgentRegistration> {
        self.agents
            .get(&agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| TesseraError::not_found(EntityType::Agent, agent_id))
    }

    pub fn is_registered(&self, agent_id: AgentId) -> bool {
        self.agents.contains_key(&agent_id)
    }

    /// The subset of `agent_ids` that is not registered, in input order.
    pub fn unregistered(&self, agent_ids: &[AgentId]) -> Vec<AgentId> {
        let mut seen = BTreeSet::new();
        agent_ids
            .iter()
            .copied()
            .filter(|id| !self.agents.contains_key(id) && seen.insert(*id))
            .collect()
    }

    pub fn list(&self) -> Vec<AgentRegistration> {
        let mut out: Vec<AgentRegistration> = self.agents.iter().map(|a| a.clone()).collect();
        out.sort_by_key(|a| a.agent_id);
        out
    }

    pub fn active_agents(&self) -> Vec<AgentId> {
        let mut out: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|a| a.is_active())
            .map(|a| a.agent_id)
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Run `f` on the registration under its shard guard.
    pub fn update<T>(
        &self,
        agent_id: AgentId,
        f: impl FnOnce(&mut AgentRegistration) -> T,
    ) -> TesseraResult<T> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| not_registered(agent_id))?;
        Ok(f(&mut entry))
    }

    pub fn heartbeat(&self, agent_id: AgentId) -> TesseraResult<()> {
        self.update(agent_id, |a| a.last_heartbeat = Utc::now())?;
        debug!(agent_id = %agent_id, "heartbeat");
        Ok(())
    }

    /// Set the status, returning the previous one.
    pub fn set_status(&self, agent_id: AgentId, status: AgentStatus) -> TesseraResult<AgentStatus> {
        self.update(agent_id, |a| std::mem::replace(&mut a.status, status))
    }

    pub fn record_share(&self, agent_id: AgentId, context_id: ContextId) -> TesseraResult<()> {
        self.update(agent_id, |a| {
            a.shared_contexts.insert(context_id);
        })
    }

    pub fn forget_share(&self, agent_id: AgentId, context_id: ContextId) {
        if let Some(mut agent) = self.agents.get_mut(&agent_id) {
            agent.shared_contexts.remove(&context_id);
        }
    }

    pub fn record_subscription(&self, agent_id: AgentId, id: SubscriptionId) -> TesseraResult<()> {
        self.update(agent_id, |a| {
            a.subscriptions.insert(id);
        })
    }

    pub fn forget_subscription(&self, agent_id: AgentId, id: SubscriptionId) {
        if let Some(mut agent) = self.agents.get_mut(&agent_id) {
            agent.subscriptions.remove(&id);
        }
    }

    /// Active agents whose last heartbeat is older than the timeout.
    pub fn stale_agents(&self, now: Timestamp) -> Vec<AgentId> {
        let Ok(timeout) = chrono::Duration::from_std(self.heartbeat_timeout) else {
            return Vec::new();
        };
        let mut out: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|a| a.is_active() && now - a.last_heartbeat > timeout)
            .map(|a| a.agent_id)
            .collect();
        out.sort();
        out
    }
}
