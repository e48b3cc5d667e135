//! Engine configuration

use crate::{ConfigError, ConflictClock, SyncMode, TesseraError, TesseraResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Weights of the four selection score components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SelectionWeights {
    pub content: f64,
    pub metadata: f64,
    pub recency: f64,
    pub priority: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            content: 0.4,
            metadata: 0.3,
            recency: 0.2,
            priority: 0.1,
        }
    }
}

impl SelectionWeights {
    pub fn total(&self) -> f64 {
        self.content + self.metadata + self.recency + self.priority
    }
}

/// Limits applied by semantic compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticLimits {
    /// Strings longer than this many characters are truncated
    pub max_string_len: usize,
    /// Arrays longer than this keep only their most recent items
    pub max_array_len: usize,
}

impl Default for SemanticLimits {
    fn default() -> Self {
        Self {
            max_string_len: 256,
            max_array_len: 20,
        }
    }
}

/// Master configuration for the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub selection_weights: SelectionWeights,
    pub recency_half_life: Duration,
    /// Default deadline for coordinator operations
    pub operation_timeout: Duration,
    /// Deadline for a single storage adapter call
    pub storage_timeout: Duration,
    pub sync_mode: SyncMode,
    pub conflict_clock: ConflictClock,
    pub reference_ttl: Option<Duration>,
    pub schema_version: u32,
    pub semantic_limits: SemanticLimits,
    pub event_history_capacity: usize,
    pub max_relationships: usize,
    /// Agents silent for longer are swept as disconnected
    pub heartbeat_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            selection_weights: SelectionWeights::default(),
            recency_half_life: Duration::from_secs(3600),
            operation_timeout: Duration::from_secs(30),
            storage_timeout: Duration::from_secs(5),
            sync_mode: SyncMode::Eventual,
            conflict_clock: ConflictClock::WallClock,
            reference_ttl: None,
            schema_version: 1,
            semantic_limits: SemanticLimits::default(),
            event_history_capacity: 1024,
            max_relationships: 256,
            heartbeat_timeout: Duration::from_secs(120),
        }
    }
}

impl EngineConfig {
    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `TESSERA_WEIGHT_CONTENT`, `TESSERA_WEIGHT_METADATA`,
    ///   `TESSERA_WEIGHT_RECENCY`, `TESSERA_WEIGHT_PRIORITY`
    /// - `TESSERA_RECENCY_HALF_LIFE_SECS` (default: 3600)
    /// - `TESSERA_OPERATION_TIMEOUT_MS` (default: 30000)
    /// - `TESSERA_STORAGE_TIMEOUT_MS` (default: 5000)
    /// - `TESSERA_SYNC_MODE`: `eventual` or `strong`
    /// - `TESSERA_CONFLICT_CLOCK`: `wall-clock` or `logical`
    /// - `TESSERA_REFERENCE_TTL_SECS` (default: unset, no expiry)
    /// - `TESSERA_SCHEMA_VERSION` (default: 1)
    /// - `TESSERA_SEMANTIC_MAX_STRING_LEN`, `TESSERA_SEMANTIC_MAX_ARRAY_LEN`
    /// - `TESSERA_EVENT_HISTORY_CAPACITY` (default: 1024)
    /// - `TESSERA_MAX_RELATIONSHIPS` (default: 256)
    /// - `TESSERA_HEARTBEAT_TIMEOUT_SECS` (default: 120)
    ///
    /// Unparseable values fall back to the default; call [`EngineConfig::validate`]
    /// afterwards to reject out-of-range ones.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        let d = Self::default();
        let w = d.selection_weights;

        Self {
            selection_weights: SelectionWeights {
                content: parsed(lookup, "TESSERA_WEIGHT_CONTENT").unwrap_or(w.content),
                metadata: parsed(lookup, "TESSERA_WEIGHT_METADATA").unwrap_or(w.metadata),
                recency: parsed(lookup, "TESSERA_WEIGHT_RECENCY").unwrap_or(w.recency),
                priority: parsed(lookup, "TESSERA_WEIGHT_PRIORITY").unwrap_or(w.priority),
            },
            recency_half_life: parsed(lookup, "TESSERA_RECENCY_HALF_LIFE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.recency_half_life),
            operation_timeout: parsed(lookup, "TESSERA_OPERATION_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.operation_timeout),
            storage_timeout: parsed(lookup, "TESSERA_STORAGE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.storage_timeout),
            sync_mode: parsed(lookup, "TESSERA_SYNC_MODE").unwrap_or(d.sync_mode),
            conflict_clock: parsed(lookup, "TESSERA_CONFLICT_CLOCK").unwrap_or(d.conflict_clock),
            reference_ttl: parsed(lookup, "TESSERA_REFERENCE_TTL_SECS")
                .map(Duration::from_secs)
                .or(d.reference_ttl),
            schema_version: parsed(lookup, "TESSERA_SCHEMA_VERSION").unwrap_or(d.schema_version),
            semantic_limits: SemanticLimits {
                max_string_len: parsed(lookup, "TESSERA_SEMANTIC_MAX_STRING_LEN")
                    .unwrap_or(d.semantic_limits.max_string_len),
                max_array_len: parsed(lookup, "TESSERA_SEMANTIC_MAX_ARRAY_LEN")
                    .unwrap_or(d.semantic_limits.max_array_len),
            },
            event_history_capacity: parsed(lookup, "TESSERA_EVENT_HISTORY_CAPACITY")
                .unwrap_or(d.event_history_capacity),
            max_relationships: parsed(lookup, "TESSERA_MAX_RELATIONSHIPS")
                .unwrap_or(d.max_relationships),
            heartbeat_timeout: parsed(lookup, "TESSERA_HEARTBEAT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.heartbeat_timeout),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - every weight is finite and non-negative, and at least one is positive
    /// - all durations are positive
    /// - capacities and semantic limits are non-zero
    pub fn validate(&self) -> TesseraResult<()> {
        let w = &self.selection_weights;
        for (field, value) in [
            ("selection_weights.content", w.content),
            ("selection_weights.metadata", w.metadata),
            ("selection_weights.recency", w.recency),
            ("selection_weights.priority", w.priority),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(invalid(field, value, "weight must be a non-negative number"));
            }
        }
        if w.total() <= 0.0 {
            return Err(invalid(
                "selection_weights",
                w.total(),
                "at least one weight must be positive",
            ));
        }

        for (field, value) in [
            ("recency_half_life", self.recency_half_life),
            ("operation_timeout", self.operation_timeout),
            ("storage_timeout", self.storage_timeout),
            ("heartbeat_timeout", self.heartbeat_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(field, format!("{:?}", value), "must be positive"));
            }
        }
        if let Some(ttl) = self.reference_ttl {
            if ttl.is_zero() {
                return Err(invalid("reference_ttl", format!("{:?}", ttl), "must be positive"));
            }
        }

        for (field, value) in [
            ("event_history_capacity", self.event_history_capacity),
            ("max_relationships", self.max_relationships),
            ("semantic_limits.max_string_len", self.semantic_limits.max_string_len),
            ("semantic_limits.max_array_len", self.semantic_limits.max_array_len),
        ] {
            if value == 0 {
                return Err(invalid(field, value, "must be greater than 0"));
            }
        }

        if self.schema_version == 0 {
            return Err(invalid("schema_version", 0, "must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> TesseraError {
    TesseraError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!((config.selection_weights.total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TESSERA_WEIGHT_CONTENT", "0.7"),
            ("TESSERA_SYNC_MODE", "strong"),
            ("TESSERA_CONFLICT_CLOCK", "logical"),
            ("TESSERA_OPERATION_TIMEOUT_MS", "250"),
            ("TESSERA_REFERENCE_TTL_SECS", "60"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.selection_weights.content, 0.7);
        assert_eq!(config.sync_mode, SyncMode::Strong);
        assert_eq!(config.conflict_clock, ConflictClock::Logical);
        assert_eq!(config.operation_timeout, Duration::from_millis(250));
        assert_eq!(config.reference_ttl, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_from_lookup_ignores_garbage() {
        let config = EngineConfig::from_lookup(|k| {
            (k == "TESSERA_MAX_RELATIONSHIPS").then(|| "lots".to_string())
        });
        assert_eq!(config.max_relationships, EngineConfig::default().max_relationships);
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let mut config = EngineConfig::default();
        config.selection_weights.recency = -0.1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("selection_weights.recency"));
    }

    #[test]
    fn test_validate_rejects_all_zero_weights() {
        let mut config = EngineConfig::default();
        config.selection_weights = SelectionWeights {
            content: 0.0,
            metadata: 0.0,
            recency: 0.0,
            priority: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = EngineConfig::default();
        config.storage_timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("storage_timeout"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.event_history_capacity = 0;
        assert!(config.validate().is_err());
    }
}
