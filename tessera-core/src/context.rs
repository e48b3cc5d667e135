//! Context entity and its mutation builder

use crate::{
    new_entity_id, AccessGrant, AgentId, BoundaryId, CompressionLevel, ContextId, ContextType,
    LifecycleState, RelationshipType, StorageTier, Timestamp, ValidationError,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Highest allowed context priority.
pub const MAX_PRIORITY: u8 = 10;

/// Clamp a score into [0, 1]. NaN collapses to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Normalize a tag: trimmed and lowercased. Blank tags are dropped.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let t = tag.trim().to_lowercase();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

// ============================================================================
// RELATIONSHIPS
// ============================================================================

/// Directed, weighted edge from one context to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub target_id: ContextId,
    pub relationship_type: RelationshipType,
    pub weight: f64,
}

impl Relationship {
    pub fn new(target_id: ContextId, relationship_type: RelationshipType, weight: f64) -> Self {
        Self {
            target_id,
            relationship_type,
            weight: clamp_unit(weight),
        }
    }

    /// Identity of an edge for uniqueness: (target, type).
    pub fn key(&self) -> (ContextId, RelationshipType) {
        (self.target_id, self.relationship_type)
    }
}

// ============================================================================
// METADATA
// ============================================================================

/// Where the authoritative copy of a context lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub tier: StorageTier,
    pub key: String,
    /// Key of the compressed blob, when one has been written
    pub compressed_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetadata {
    pub priority: u8,
    pub relevance_score: f64,
    pub compression_level: CompressionLevel,
    pub owner: Option<AgentId>,
    pub permissions: BTreeMap<AgentId, AccessGrant>,
    pub tags: BTreeSet<String>,
    pub access_count: u64,
    pub last_accessed_by: Option<AgentId>,
    pub storage: Option<StorageLocation>,
    pub boundary_id: Option<BoundaryId>,
    pub schema_version: u32,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl Default for ContextMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            priority: 5,
            relevance_score: 0.5,
            compression_level: CompressionLevel::None,
            owner: None,
            permissions: BTreeMap::new(),
            tags: BTreeSet::new(),
            access_count: 0,
            last_accessed_by: None,
            storage: None,
            boundary_id: None,
            schema_version: 1,
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            expires_at: None,
        }
    }
}

impl ContextMetadata {
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance_score = clamp_unit(relevance);
        self
    }

    pub fn with_owner(mut self, owner: AgentId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags
            .extend(tags.into_iter().filter_map(|t| normalize_tag(t.as_ref())));
        self
    }

    pub fn with_expiry(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_grant(mut self, agent_id: AgentId, grant: AccessGrant) -> Self {
        self.permissions.insert(agent_id, grant);
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.schema_version = schema_version;
        self
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// The unit of shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub id: ContextId,
    pub context_type: ContextType,
    pub content: Value,
    pub metadata: ContextMetadata,
    pub relationships: Vec<Relationship>,
    /// Starts at 1 and increases by one per committed mutation
    pub version: u64,
    pub state: LifecycleState,
}

impl Context {
    pub fn new(context_type: ContextType, content: Value, metadata: ContextMetadata) -> Self {
        Self {
            id: new_entity_id(),
            context_type,
            content,
            metadata,
            relationships: Vec::new(),
            version: 1,
            state: LifecycleState::Created,
        }
    }

    /// Check the content schema, metadata ranges and relationship invariants.
    pub fn validate(&self, max_relationships: usize) -> Result<(), ValidationError> {
        validate_content(self.context_type, &self.content)?;

        if self.metadata.priority > MAX_PRIORITY {
            return Err(ValidationError::InvalidValue {
                field: "priority".to_string(),
                reason: format!("{} exceeds maximum {}", self.metadata.priority, MAX_PRIORITY),
            });
        }
        if !(0.0..=1.0).contains(&self.metadata.relevance_score) {
            return Err(ValidationError::InvalidValue {
                field: "relevance_score".to_string(),
                reason: "must be within [0, 1]".to_string(),
            });
        }
        if self.relationships.len() > max_relationships {
            return Err(ValidationError::ConstraintViolation {
                constraint: "max_relationships".to_string(),
                reason: format!(
                    "{} relationships exceed limit {}",
                    self.relationships.len(),
                    max_relationships
                ),
            });
        }

        let mut seen = BTreeSet::new();
        for rel in &self.relationships {
            if rel.target_id == self.id {
                return Err(ValidationError::SelfReference {
                    context_id: self.id,
                });
            }
            if !(0.0..=1.0).contains(&rel.weight) {
                return Err(ValidationError::InvalidValue {
                    field: "relationships.weight".to_string(),
                    reason: "must be within [0, 1]".to_string(),
                });
            }
            if !seen.insert(rel.key()) {
                return Err(ValidationError::DuplicateRelationship {
                    target_id: rel.target_id,
                    relationship_type: rel.relationship_type,
                });
            }
        }
        Ok(())
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.metadata.expires_at.is_some_and(|at| at <= now)
    }

    /// Add an edge, rejecting self references and duplicate (target, type) pairs.
    pub fn add_relationship(&mut self, relationship: Relationship) -> Result<(), ValidationError> {
        if relationship.target_id == self.id {
            return Err(ValidationError::SelfReference {
                context_id: self.id,
            });
        }
        if self
            .relationships
            .iter()
            .any(|r| r.key() == relationship.key())
        {
            return Err(ValidationError::DuplicateRelationship {
                target_id: relationship.target_id,
                relationship_type: relationship.relationship_type,
            });
        }
        self.relationships.push(relationship);
        Ok(())
    }

    /// Remove an edge. Returns whether it existed.
    pub fn remove_relationship(
        &mut self,
        target_id: ContextId,
        relationship_type: RelationshipType,
    ) -> bool {
        let before = self.relationships.len();
        self.relationships
            .retain(|r| r.key() != (target_id, relationship_type));
        before != self.relationships.len()
    }

    /// Look up a content field by dotted path (`profile.name`).
    pub fn content_field(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .try_fold(&self.content, |value, segment| value.get(segment))
    }

    /// All string leaves of the content, lowercased and space-joined.
    pub fn text_content(&self) -> String {
        let mut out = Vec::new();
        collect_text(&self.content, &mut out);
        out.join(" ").to_lowercase()
    }

    pub fn grant_for(&self, agent_id: AgentId) -> Option<AccessGrant> {
        self.metadata.permissions.get(&agent_id).copied()
    }
}

fn collect_text(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}

/// Per-type content schema.
pub fn validate_content(context_type: ContextType, content: &Value) -> Result<(), ValidationError> {
    let obj = content
        .as_object()
        .ok_or_else(|| ValidationError::InvalidValue {
            field: "content".to_string(),
            reason: "content must be a JSON object".to_string(),
        })?;

    match context_type {
        ContextType::Task => match obj.get("title") {
            Some(Value::String(title)) if !title.trim().is_empty() => Ok(()),
            Some(_) => Err(ValidationError::InvalidValue {
                field: "content.title".to_string(),
                reason: "must be a non-empty string".to_string(),
            }),
            None => Err(ValidationError::RequiredFieldMissing {
                field: "content.title".to_string(),
            }),
        },
        ContextType::Conversation => require_array(obj, "messages"),
        ContextType::Workflow => require_array(obj, "steps"),
        ContextType::Distributed | ContextType::Session | ContextType::Knowledge => Ok(()),
    }
}

fn require_array(obj: &Map<String, Value>, field: &str) -> Result<(), ValidationError> {
    match obj.get(field) {
        Some(Value::Array(_)) => Ok(()),
        Some(_) => Err(ValidationError::InvalidValue {
            field: format!("content.{}", field),
            reason: "must be an array".to_string(),
        }),
        None => Err(ValidationError::RequiredFieldMissing {
            field: format!("content.{}", field),
        }),
    }
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// Field updates address top-level content keys only. A dotted name would be
/// stored as a literal key, so it is rejected instead.
pub fn check_field_name(field: &str) -> Result<(), ValidationError> {
    if field.trim().is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: "field".to_string(),
        });
    }
    if field.contains('.') {
        return Err(ValidationError::InvalidValue {
            field: field.to_string(),
            reason: "nested paths are not supported; name a top-level field".to_string(),
        });
    }
    Ok(())
}

/// A versioned change to a context's content, metadata or relationships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextMutation {
    pub content: Option<Value>,
    pub set_fields: BTreeMap<String, Value>,
    pub remove_fields: Vec<String>,
    pub priority: Option<u8>,
    pub relevance_score: Option<f64>,
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
    pub add_relationships: Vec<Relationship>,
    pub remove_relationships: Vec<(ContextId, RelationshipType)>,
    pub expires_at: Option<Option<Timestamp>>,
    pub grants: BTreeMap<AgentId, AccessGrant>,
    pub revoke_grants: Vec<AgentId>,
}

impl ContextMutation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    /// Set a top-level content field. See [`check_field_name`].
    pub fn set_field(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set_fields.insert(field.into(), value);
        self
    }

    pub fn remove_field(mut self, field: impl Into<String>) -> Self {
        self.remove_fields.push(field.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn relevance(mut self, relevance: f64) -> Self {
        self.relevance_score = Some(relevance);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.add_tags.push(tag.into());
        self
    }

    pub fn untag(mut self, tag: impl Into<String>) -> Self {
        self.remove_tags.push(tag.into());
        self
    }

    pub fn relate(mut self, relationship: Relationship) -> Self {
        self.add_relationships.push(relationship);
        self
    }

    pub fn unrelate(mut self, target_id: ContextId, relationship_type: RelationshipType) -> Self {
        self.remove_relationships.push((target_id, relationship_type));
        self
    }

    pub fn expires_at(mut self, expires_at: Option<Timestamp>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn grant(mut self, agent_id: AgentId, grant: AccessGrant) -> Self {
        self.grants.insert(agent_id, grant);
        self
    }

    pub fn revoke(mut self, agent_id: AgentId) -> Self {
        self.revoke_grants.push(agent_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply to `context` in place. The caller validates the result.
    pub fn apply(&self, context: &mut Context) -> Result<(), ValidationError> {
        if let Some(content) = &self.content {
            context.content = content.clone();
        }

        if !self.set_fields.is_empty() || !self.remove_fields.is_empty() {
            for field in self.set_fields.keys().chain(&self.remove_fields) {
                check_field_name(field)?;
            }
            let obj = context
                .content
                .as_object_mut()
                .ok_or_else(|| ValidationError::InvalidValue {
                    field: "content".to_string(),
                    reason: "field updates require object content".to_string(),
                })?;
            for (field, value) in &self.set_fields {
                obj.insert(field.clone(), value.clone());
            }
            for field in &self.remove_fields {
                obj.remove(field);
            }
        }

        let meta = &mut context.metadata;
        if let Some(priority) = self.priority {
            meta.priority = priority;
        }
        if let Some(relevance) = self.relevance_score {
            meta.relevance_score = clamp_unit(relevance);
        }
        meta.tags
            .extend(self.add_tags.iter().filter_map(|t| normalize_tag(t)));
        for tag in self.remove_tags.iter().filter_map(|t| normalize_tag(t)) {
            meta.tags.remove(&tag);
        }
        if let Some(expires_at) = self.expires_at {
            meta.expires_at = expires_at;
        }
        for (agent_id, grant) in &self.grants {
            meta.permissions.insert(*agent_id, *grant);
        }
        for agent_id in &self.revoke_grants {
            meta.permissions.remove(agent_id);
        }

        for (target_id, relationship_type) in &self.remove_relationships {
            context.remove_relationship(*target_id, *relationship_type);
        }
        for relationship in &self.add_relationships {
            context.add_relationship(relationship.clone())?;
        }

        context.metadata.updated_at = Utc::now();
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_clamp_unit_in_range(v in proptest::num::f64::ANY) {
            let c = clamp_unit(v);
            prop_assert!((0.0..=1.0).contains(&c));
        }

        #[test]
        fn prop_relationship_weight_clamped(w in -10.0f64..10.0) {
            let rel = Relationship::new(new_entity_id(), RelationshipType::Reference, w);
            prop_assert!((0.0..=1.0).contains(&rel.weight));
        }

        #[test]
        fn prop_relevance_mutation_clamped(r in -5.0f64..5.0) {
            let mut ctx = Context::new(
                ContextType::Session,
                serde_json::json!({}),
                ContextMetadata::default(),
            );
            ContextMutation::new().relevance(r).apply(&mut ctx).unwrap();
            prop_assert!((0.0..=1.0).contains(&ctx.metadata.relevance_score));
        }
    }
}
