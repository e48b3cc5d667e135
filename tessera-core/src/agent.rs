//! Agent registrations, shares and subscriptions

use crate::{
    AgentId, AgentStatus, ContextId, ContextType, EventTypeFilter, Permissions, SubscriptionId,
    Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What an agent is able to do with shared contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_share: bool,
    pub max_concurrent_contexts: usize,
    /// Empty means every context type
    pub supported_types: BTreeSet<ContextType>,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_share: false,
            max_concurrent_contexts: 64,
            supported_types: BTreeSet::new(),
        }
    }
}

impl AgentCapabilities {
    pub fn read_only() -> Self {
        Self {
            can_write: false,
            ..Self::default()
        }
    }

    pub fn supports(&self, context_type: ContextType) -> bool {
        self.supported_types.is_empty() || self.supported_types.contains(&context_type)
    }

    /// Capability-limited subset of `requested`.
    pub fn cap(&self, requested: Permissions) -> Permissions {
        let mut allowed = Permissions::all();
        if !self.can_read {
            allowed.remove(Permissions::READ);
        }
        if !self.can_write {
            allowed.remove(Permissions::WRITE);
        }
        if !self.can_share {
            allowed.remove(Permissions::SHARE);
        }
        requested & allowed
    }
}

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub name: String,
    pub capabilities: AgentCapabilities,
    pub status: AgentStatus,
    pub shared_contexts: BTreeSet<ContextId>,
    pub subscriptions: BTreeSet<SubscriptionId>,
    pub registered_at: Timestamp,
    pub last_heartbeat: Timestamp,
}

impl AgentRegistration {
    pub fn new(agent_id: AgentId, name: impl Into<String>, capabilities: AgentCapabilities) -> Self {
        let now = Utc::now();
        Self {
            agent_id,
            name: name.into(),
            capabilities,
            status: AgentStatus::Active,
            shared_contexts: BTreeSet::new(),
            subscriptions: BTreeSet::new(),
            registered_at: now,
            last_heartbeat: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Whether one more shared context fits the agent's limit.
    pub fn has_capacity(&self) -> bool {
        self.shared_contexts.len() < self.capabilities.max_concurrent_contexts
    }
}

/// A context shared with one agent. Keyed by (context, agent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub context_id: ContextId,
    pub agent_id: AgentId,
    pub permissions: Permissions,
    pub shared_by: Option<AgentId>,
    pub shared_at: Timestamp,
    pub acknowledged_at: Option<Timestamp>,
}

impl ShareRecord {
    pub fn new(
        context_id: ContextId,
        agent_id: AgentId,
        permissions: Permissions,
        shared_by: Option<AgentId>,
    ) -> Self {
        Self {
            context_id,
            agent_id,
            permissions,
            shared_by,
            shared_at: Utc::now(),
            acknowledged_at: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Storage key of this record.
    pub fn storage_key(&self) -> String {
        share_key(self.context_id, self.agent_id)
    }
}

pub fn share_key(context_id: ContextId, agent_id: AgentId) -> String {
    format!("shares/{}/{}", context_id, agent_id)
}

/// An agent's interest in events, optionally narrowed to one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub agent_id: AgentId,
    pub context_id: Option<ContextId>,
    pub filter: EventTypeFilter,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::new_entity_id;

    #[test]
    fn test_capabilities_cap_permissions() {
        let caps = AgentCapabilities::read_only();
        let capped = caps.cap(Permissions::read_write() | Permissions::SHARE);
        assert_eq!(capped, Permissions::READ);
    }

    #[test]
    fn test_supports_empty_means_all() {
        let caps = AgentCapabilities::default();
        assert!(caps.supports(ContextType::Workflow));
        let narrow = AgentCapabilities {
            supported_types: [ContextType::Task].into_iter().collect(),
            ..AgentCapabilities::default()
        };
        assert!(narrow.supports(ContextType::Task));
        assert!(!narrow.supports(ContextType::Conversation));
    }

    #[test]
    fn test_capacity() {
        let mut reg = AgentRegistration::new(
            new_entity_id(),
            "planner",
            AgentCapabilities {
                max_concurrent_contexts: 1,
                ..AgentCapabilities::default()
            },
        );
        assert!(reg.has_capacity());
        reg.shared_contexts.insert(new_entity_id());
        assert!(!reg.has_capacity());
    }

    #[test]
    fn test_share_key_layout() {
        let c = new_entity_id();
        let a = new_entity_id();
        let record = ShareRecord::new(c, a, Permissions::READ, None);
        assert_eq!(record.storage_key(), format!("shares/{}/{}", c, a));
        assert!(!record.is_acknowledged());
    }
}
