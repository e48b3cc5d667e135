//! Event envelope published on the event bus

use crate::enums::{string_enum, EnumParseError};
use crate::{
    new_entity_id, AgentId, ContextId, EventId, LifecycleEvent, LifecycleState, Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// EVENT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ContextCreated,
    /// Lifecycle transition committed
    StateChanged,
    ContextUpdated,
    ContextAccessed,
    ContextCompressed,
    ContextArchived,
    ContextRestored,
    ContextDeleted,
    ContextExternalized,
    BoundaryAssigned,
    ContextShared,
    ShareAcknowledged,
    ShareRevoked,
    SyncCompleted,
    ConflictDetected,
    ConflictResolved,
    AgentRegistered,
    AgentUnregistered,
    AgentDisconnected,
    AgentReconnected,
}

string_enum!(EventType, "event type", {
    ContextCreated => "context-created",
    StateChanged => "state-changed",
    ContextUpdated => "context-updated",
    ContextAccessed => "context-accessed",
    ContextCompressed => "context-compressed",
    ContextArchived => "context-archived",
    ContextRestored => "context-restored",
    ContextDeleted => "context-deleted",
    ContextExternalized => "context-externalized",
    BoundaryAssigned => "boundary-assigned",
    ContextShared => "context-shared",
    ShareAcknowledged => "share-acknowledged",
    ShareRevoked => "share-revoked",
    SyncCompleted => "sync-completed",
    ConflictDetected => "conflict-detected",
    ConflictResolved => "conflict-resolved",
    AgentRegistered => "agent-registered",
    AgentUnregistered => "agent-unregistered",
    AgentDisconnected => "agent-disconnected",
    AgentReconnected => "agent-reconnected",
});

/// Which event types a subscriber wants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "types")]
pub enum EventTypeFilter {
    #[default]
    All,
    Only(BTreeSet<EventType>),
}

impl EventTypeFilter {
    pub fn only<I: IntoIterator<Item = EventType>>(types: I) -> Self {
        EventTypeFilter::Only(types.into_iter().collect())
    }

    pub fn matches(&self, event_type: EventType) -> bool {
        match self {
            EventTypeFilter::All => true,
            EventTypeFilter::Only(types) => types.contains(&event_type),
        }
    }
}

// ============================================================================
// EVENT ENVELOPE
// ============================================================================

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEvent {
    pub id: EventId,
    pub event_type: EventType,
    pub context_id: Option<ContextId>,
    pub agent_id: Option<AgentId>,
    pub timestamp: Timestamp,
    pub data: Value,
}

impl ContextEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            id: new_entity_id(),
            event_type,
            context_id: None,
            agent_id: None,
            timestamp: Utc::now(),
            data: Value::Null,
        }
    }

    pub fn for_context(event_type: EventType, context_id: ContextId) -> Self {
        Self::new(event_type).with_context(context_id)
    }

    pub fn for_agent(event_type: EventType, agent_id: AgentId) -> Self {
        Self::new(event_type).with_agent(agent_id)
    }

    /// Lifecycle transition event `{from, to, event, version}`.
    pub fn transition(
        context_id: ContextId,
        from: LifecycleState,
        to: LifecycleState,
        event: LifecycleEvent,
        version: u64,
    ) -> Self {
        Self::for_context(EventType::StateChanged, context_id).with_data(json!({
            "from": from.as_str(),
            "to": to.as_str(),
            "event": event.as_str(),
            "version": version,
        }))
    }

    pub fn with_context(mut self, context_id: ContextId) -> Self {
        self.context_id = Some(context_id);
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// `(from, to)` of a `StateChanged` event.
    pub fn transition_states(&self) -> Option<(LifecycleState, LifecycleState)> {
        if self.event_type != EventType::StateChanged {
            return None;
        }
        let from = self.data.get("from")?.as_str()?.parse().ok()?;
        let to = self.data.get("to")?.as_str()?.parse().ok()?;
        Some((from, to))
    }
}
