//! Conflict records and resolutions

use crate::enums::{string_enum, EnumParseError};
use crate::{
    new_entity_id, AgentId, ConflictId, ConflictSeverity, ConflictType, ContextId,
    ResolutionStrategy, Timestamp,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A field value proposed by an agent for the next synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedChange {
    pub agent_id: AgentId,
    pub field: String,
    pub value: Value,
    /// Agent-reported wall clock
    pub timestamp: Timestamp,
    /// Per-context arrival order, assigned on intake
    pub sequence: u64,
    pub schema_version: u32,
}

impl ProposedChange {
    /// A proposal stamped now, against schema version 1. The sequence is
    /// assigned when the coordinator accepts it.
    pub fn new(agent_id: AgentId, field: impl Into<String>, value: Value) -> Self {
        Self {
            agent_id,
            field: field.into(),
            value,
            timestamp: Utc::now(),
            sequence: 0,
            schema_version: 1,
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStatus {
    #[default]
    Detected,
    Resolved,
    Escalated,
}

string_enum!(ConflictStatus, "conflict status", {
    Detected => "detected",
    Resolved => "resolved",
    Escalated => "escalated",
});

/// Who settled a conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum Resolver {
    Automatic,
    Agent(AgentId),
    Operator(String),
}

impl fmt::Display for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolver::Automatic => f.write_str("automatic"),
            Resolver::Agent(id) => write!(f, "agent:{}", id),
            Resolver::Operator(name) => write!(f, "operator:{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub strategy: ResolutionStrategy,
    pub value: Value,
    pub resolved_by: Resolver,
    pub winner: Option<AgentId>,
    pub resolved_at: Timestamp,
}

impl ConflictResolution {
    pub fn automatic(strategy: ResolutionStrategy, value: Value, winner: Option<AgentId>) -> Self {
        Self {
            strategy,
            value,
            resolved_by: Resolver::Automatic,
            winner,
            resolved_at: Utc::now(),
        }
    }

    pub fn manual(value: Value, resolved_by: Resolver) -> Self {
        Self {
            strategy: ResolutionStrategy::Manual,
            value,
            resolved_by,
            winner: None,
            resolved_at: Utc::now(),
        }
    }
}

/// A detected disagreement on one field of one context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub context_id: ContextId,
    pub field: String,
    pub proposals: Vec<ProposedChange>,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
    pub requires_manual_resolution: bool,
    pub detected_at: Timestamp,
}

impl ConflictRecord {
    pub fn new(
        context_id: ContextId,
        field: impl Into<String>,
        conflict_type: ConflictType,
        proposals: Vec<ProposedChange>,
    ) -> Self {
        Self {
            id: new_entity_id(),
            context_id,
            field: field.into(),
            proposals,
            conflict_type,
            severity: default_severity(conflict_type),
            status: ConflictStatus::Detected,
            resolution: None,
            requires_manual_resolution: !conflict_type.is_auto_resolvable(),
            detected_at: Utc::now(),
        }
    }

    /// Latest proposed value per agent, in arrival order.
    pub fn values_by_agent(&self) -> BTreeMap<AgentId, Value> {
        let mut ordered: Vec<&ProposedChange> = self.proposals.iter().collect();
        ordered.sort_by_key(|p| p.sequence);
        ordered
            .into_iter()
            .map(|p| (p.agent_id, p.value.clone()))
            .collect()
    }

    pub fn is_resolved(&self) -> bool {
        self.status == ConflictStatus::Resolved
    }

    pub fn resolve(&mut self, resolution: ConflictResolution) {
        self.resolution = Some(resolution);
        self.status = ConflictStatus::Resolved;
    }

    pub fn escalate(&mut self) {
        self.requires_manual_resolution = true;
        self.status = ConflictStatus::Escalated;
    }
}

/// Severity assigned when a conflict is first detected.
pub fn default_severity(conflict_type: ConflictType) -> ConflictSeverity {
    match conflict_type {
        ConflictType::FieldModification => ConflictSeverity::Low,
        ConflictType::ConcurrentUpdate => ConflictSeverity::Medium,
        ConflictType::SchemaMismatch => ConflictSeverity::High,
        ConflictType::AccessViolation => ConflictSeverity::Critical,
    }
}
