//! Error types for Tessera operations

use crate::{
    AgentId, ConflictRecord, ContextId, EntityType, LifecycleEvent, LifecycleState, Operation,
    RelationshipType, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Flat error taxonomy exposed to callers.
///
/// Every `TesseraError` maps to exactly one kind, so callers can branch on the
/// kind without matching on the structured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    NotFound,
    InvalidTransition,
    VersionConflict,
    AgentNotRegistered,
    AgentAlreadyRegistered,
    AccessDenied,
    UnresolvedConflict,
    Expired,
    Timeout,
    StorageUnavailable,
    ValidationError,
    Serialization,
}

impl ErrorKind {
    /// Whether the caller is expected to re-read state and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::VersionConflict
                | ErrorKind::InvalidTransition
                | ErrorKind::Timeout
                | ErrorKind::StorageUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidTransition => "invalid-transition",
            ErrorKind::VersionConflict => "version-conflict",
            ErrorKind::AgentNotRegistered => "agent-not-registered",
            ErrorKind::AgentAlreadyRegistered => "agent-already-registered",
            ErrorKind::AccessDenied => "access-denied",
            ErrorKind::UnresolvedConflict => "unresolved-conflict",
            ErrorKind::Expired => "expired",
            ErrorKind::Timeout => "timeout",
            ErrorKind::StorageUnavailable => "storage-unavailable",
            ErrorKind::ValidationError => "validation-error",
            ErrorKind::Serialization => "serialization",
        };
        f.write_str(s)
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },

    #[error("Context {context_id} cannot reference itself")]
    SelfReference { context_id: ContextId },

    #[error("Duplicate relationship to {target_id} of type {relationship_type}")]
    DuplicateRelationship {
        target_id: ContextId,
        relationship_type: RelationshipType,
    },

    #[error("Integrity check failed for {key}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all Tessera errors.
#[derive(Debug, Clone, Error)]
pub enum TesseraError {
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: EntityType, id: String },

    #[error("Invalid transition for context {context_id}: {event} not allowed from {from}")]
    InvalidTransition {
        context_id: ContextId,
        from: LifecycleState,
        event: LifecycleEvent,
    },

    #[error("Version conflict on context {context_id}: expected {expected}, current {actual}")]
    VersionConflict {
        context_id: ContextId,
        expected: u64,
        actual: u64,
    },

    #[error("Agents not registered: {agent_ids:?}")]
    AgentNotRegistered { agent_ids: Vec<AgentId> },

    #[error("Agent already registered: {agent_id}")]
    AgentAlreadyRegistered { agent_id: AgentId },

    #[error("Access denied for agent {agent_id}: {operation} on context {context_id}")]
    AccessDenied {
        agent_id: AgentId,
        context_id: ContextId,
        operation: Operation,
    },

    #[error("Unresolved conflicts on context {context_id}: {} pending", .conflicts.len())]
    UnresolvedConflict {
        context_id: ContextId,
        conflicts: Vec<ConflictRecord>,
    },

    #[error("{key} expired at {expired_at}")]
    Expired { key: String, expired_at: Timestamp },

    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Storage backend {backend} unavailable: {reason}")]
    StorageUnavailable { backend: String, reason: String },

    /// An in-memory value could not be encoded. Undecodable bytes read back
    /// from a backend are reported as `StorageUnavailable` instead.
    #[error("Failed to serialize {what}: {reason}")]
    Serialization { what: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TesseraError {
    /// The flat kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TesseraError::NotFound { .. } => ErrorKind::NotFound,
            TesseraError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            TesseraError::VersionConflict { .. } => ErrorKind::VersionConflict,
            TesseraError::AgentNotRegistered { .. } => ErrorKind::AgentNotRegistered,
            TesseraError::AgentAlreadyRegistered { .. } => ErrorKind::AgentAlreadyRegistered,
            TesseraError::AccessDenied { .. } => ErrorKind::AccessDenied,
            TesseraError::UnresolvedConflict { .. } => ErrorKind::UnresolvedConflict,
            TesseraError::Expired { .. } => ErrorKind::Expired,
            TesseraError::Timeout { .. } => ErrorKind::Timeout,
            TesseraError::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            TesseraError::Serialization { .. } => ErrorKind::Serialization,
            TesseraError::Validation(_) | TesseraError::Config(_) => ErrorKind::ValidationError,
        }
    }

    pub fn not_found(entity_type: EntityType, id: impl ToString) -> Self {
        TesseraError::NotFound {
            entity_type,
            id: id.to_string(),
        }
    }

    pub fn storage(backend: impl Into<String>, reason: impl ToString) -> Self {
        TesseraError::StorageUnavailable {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    pub fn serialization(what: impl Into<String>, reason: impl ToString) -> Self {
        TesseraError::Serialization {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for Tessera operations.
pub type TesseraResult<T> = Result<T, TesseraError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_not_found_display() {
        let err = TesseraError::not_found(EntityType::Context, Uuid::nil());
        let msg = err.to_string();
        assert!(msg.contains("context not found"));
        assert!(msg.contains("00000000-0000-0000-0000-000000000000"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_version_conflict_carries_versions() {
        let err = TesseraError::VersionConflict {
            context_id: Uuid::nil(),
            expected: 1,
            actual: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 1"));
        assert!(msg.contains("current 2"));
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = TesseraError::InvalidTransition {
            context_id: Uuid::nil(),
            from: LifecycleState::Deleted,
            event: LifecycleEvent::Update,
        };
        let msg = err.to_string();
        assert!(msg.contains("update"));
        assert!(msg.contains("deleted"));
    }

    #[test]
    fn test_sub_errors_fold_into_master() {
        let validation = TesseraError::from(ValidationError::RequiredFieldMissing {
            field: "title".to_string(),
        });
        assert!(matches!(validation, TesseraError::Validation(_)));
        assert_eq!(validation.kind(), ErrorKind::ValidationError);

        let config = TesseraError::from(ConfigError::InvalidValue {
            field: "storage_timeout".to_string(),
            value: "0ms".to_string(),
            reason: "must be positive".to_string(),
        });
        assert!(matches!(config, TesseraError::Config(_)));
        assert!(config.to_string().contains("storage_timeout"));
    }

    #[test]
    fn test_storage_helper() {
        let err = TesseraError::storage("lmdb", "disk full");
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(err.to_string().contains("lmdb"));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_serialization_helper() {
        let err = TesseraError::serialization("context projection", "key must be a string");
        assert_eq!(err.kind(), ErrorKind::Serialization);
        assert_eq!(err.kind().to_string(), "serialization");
        assert!(!err.kind().is_retryable());
        assert!(err.to_string().contains("context projection"));
    }

    #[test]
    fn test_unresolved_conflict_counts_pending() {
        let err = TesseraError::UnresolvedConflict {
            context_id: Uuid::nil(),
            conflicts: vec![],
        };
        assert!(err.to_string().contains("0 pending"));
        assert!(!err.kind().is_retryable());
    }
}
