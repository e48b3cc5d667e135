//! Enum types for Tessera entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its string representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

/// Implements `as_str`, `Display` and `FromStr` over a fixed string table.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Stable string representation used in keys and event payloads.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }

            /// All variants, in declaration order.
            pub fn all() -> &'static [$ty] {
                &[$($ty::$variant,)+]
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = s.trim().to_lowercase().replace('_', "-");
                match normalized.as_str() {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(EnumParseError {
                        kind: $kind,
                        value: s.to_string(),
                    }),
                }
            }
        }
    };
}

pub(crate) use string_enum;

// ============================================================================
// ENTITY DISCRIMINATOR
// ============================================================================

/// Entity type discriminator used in `NotFound` errors and storage keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Context,
    Relationship,
    Agent,
    Share,
    Subscription,
    Boundary,
    Conflict,
    Reference,
    Blob,
    Record,
}

string_enum!(EntityType, "entity type", {
    Context => "context",
    Relationship => "relationship",
    Agent => "agent",
    Share => "share",
    Subscription => "subscription",
    Boundary => "boundary",
    Conflict => "conflict",
    Reference => "reference",
    Blob => "blob",
    Record => "record",
});

// ============================================================================
// CONTEXT ENUMS
// ============================================================================

/// Closed set of context kinds. The content schema depends on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextType {
    /// Chat-style exchange; content carries `messages`
    Conversation,
    /// Unit of work; content carries a `title`
    Task,
    /// Multi-step process; content carries `steps`
    Workflow,
    /// State shared across agents
    Distributed,
    /// Session-scoped scratch state
    Session,
    /// Long-lived knowledge
    Knowledge,
}

string_enum!(ContextType, "context type", {
    Conversation => "conversation",
    Task => "task",
    Workflow => "workflow",
    Distributed => "distributed",
    Session => "session",
    Knowledge => "knowledge",
});

/// Kind of edge between two contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationshipType {
    Parent,
    Child,
    Sibling,
    Reference,
    DependsOn,
}

string_enum!(RelationshipType, "relationship type", {
    Parent => "parent",
    Child => "child",
    Sibling => "sibling",
    Reference => "reference",
    DependsOn => "depends-on",
});

/// Compression currently applied to a context's persisted form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionLevel {
    #[default]
    None,
    Lossless,
    Semantic,
}

string_enum!(CompressionLevel, "compression level", {
    None => "none",
    Lossless => "lossless",
    Semantic => "semantic",
});

/// Compression algorithm requested from the Compress strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionAlgorithm {
    /// Byte-identical round trip
    Lossless,
    /// Trades fidelity for size; reports a quality impact
    Semantic,
}

string_enum!(CompressionAlgorithm, "compression algorithm", {
    Lossless => "lossless",
    Semantic => "semantic",
});

impl CompressionAlgorithm {
    /// The compression level recorded on a context compressed with this algorithm.
    pub fn level(&self) -> CompressionLevel {
        match self {
            CompressionAlgorithm::Lossless => CompressionLevel::Lossless,
            CompressionAlgorithm::Semantic => CompressionLevel::Semantic,
        }
    }
}

/// Where the Write strategy externalizes a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageTarget {
    Scratchpad,
    Memory,
    StateObject,
}

string_enum!(StorageTarget, "storage target", {
    Scratchpad => "scratchpad",
    Memory => "memory",
    StateObject => "state-object",
});

impl StorageTarget {
    /// Key namespace used for references written to this target.
    pub fn namespace(&self) -> &'static str {
        match self {
            StorageTarget::Scratchpad => "scratchpad",
            StorageTarget::Memory => "memory",
            StorageTarget::StateObject => "state",
        }
    }
}

/// Which backing store currently holds a context record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageTier {
    Hot,
    Indexed,
    Archive,
}

string_enum!(StorageTier, "storage tier", {
    Hot => "hot",
    Indexed => "indexed",
    Archive => "archive",
});

// ============================================================================
// AGENT ENUMS
// ============================================================================

/// Connection status of a registered agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentStatus {
    #[default]
    Active,
    Inactive,
    Disconnected,
}

string_enum!(AgentStatus, "agent status", {
    Active => "active",
    Inactive => "inactive",
    Disconnected => "disconnected",
});

/// Operation checked against isolation boundaries and grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Read,
    Write,
    Share,
    Delete,
    Compress,
    Admin,
}

string_enum!(Operation, "operation", {
    Read => "read",
    Write => "write",
    Share => "share",
    Delete => "delete",
    Compress => "compress",
    Admin => "admin",
});

// ============================================================================
// COORDINATION ENUMS
// ============================================================================

/// Kind of conflict detected during synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    /// Agents proposed different objects for the same field
    FieldModification,
    /// Agents proposed different scalar values for the same field
    ConcurrentUpdate,
    /// A proposal came from an agent without write access
    AccessViolation,
    /// A proposal does not fit the context's schema
    SchemaMismatch,
}

string_enum!(ConflictType, "conflict type", {
    FieldModification => "field-modification",
    ConcurrentUpdate => "concurrent-update",
    AccessViolation => "access-violation",
    SchemaMismatch => "schema-mismatch",
});

impl ConflictType {
    /// Whether the coordinator may resolve this type without an operator.
    pub fn is_auto_resolvable(&self) -> bool {
        matches!(
            self,
            ConflictType::FieldModification | ConflictType::ConcurrentUpdate
        )
    }
}

/// Severity attached to a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

string_enum!(ConflictSeverity, "conflict severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Strategy applied to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    LastWriterWins,
    ShallowMerge,
    Manual,
}

string_enum!(ResolutionStrategy, "resolution strategy", {
    LastWriterWins => "last-writer-wins",
    ShallowMerge => "shallow-merge",
    Manual => "manual",
});

/// Consistency mode for cross-agent synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Best-effort, at-least-once propagation
    #[default]
    Eventual,
    /// Every reachable agent must accept the propagation
    Strong,
}

string_enum!(SyncMode, "sync mode", {
    Eventual => "eventual",
    Strong => "strong",
});

/// Clock used to order proposals for last-writer-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictClock {
    /// Agent-reported timestamps, arrival order breaks ties
    #[default]
    WallClock,
    /// Per-context arrival sequence only
    Logical,
}

string_enum!(ConflictClock, "conflict clock", {
    WallClock => "wall-clock",
    Logical => "logical",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_type_round_trip() {
        for ty in ContextType::all() {
            let parsed: ContextType = ty.as_str().parse().unwrap();
            assert_eq!(parsed, *ty);
        }
    }

    #[test]
    fn test_relationship_type_accepts_underscore() {
        assert_eq!(
            "depends_on".parse::<RelationshipType>().unwrap(),
            RelationshipType::DependsOn
        );
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = "spreadsheet".parse::<ContextType>().unwrap_err();
        assert!(err.to_string().contains("spreadsheet"));
    }

    #[test]
    fn test_conflict_type_auto_resolvable() {
        assert!(ConflictType::FieldModification.is_auto_resolvable());
        assert!(ConflictType::ConcurrentUpdate.is_auto_resolvable());
        assert!(!ConflictType::AccessViolation.is_auto_resolvable());
        assert!(!ConflictType::SchemaMismatch.is_auto_resolvable());
    }

    #[test]
    fn test_serde_uses_kebab_case() {
        let json = serde_json::to_string(&ConflictType::FieldModification).unwrap();
        assert_eq!(json, "\"field-modification\"");
        let json = serde_json::to_string(&StorageTarget::StateObject).unwrap();
        assert_eq!(json, "\"state-object\"");
    }
}
