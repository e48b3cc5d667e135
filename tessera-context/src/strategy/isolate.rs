//! Isolate strategy: boundaries, permission checks and field projection.
//!
//! Access is evaluated in a fixed order, first match wins:
//!
//! 1. the context's boundary denies the operation
//! 2. the context's ACL explicitly denies it for the agent
//! 3. the agent owns the context
//! 4. the boundary does not admit the agent
//! 5. ACL allows plus share grants, capped by the boundary's allow set
//! 6. otherwise deny
//!
//! An expired or unknown boundary is treated as no boundary.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Mutex;
use tessera_core::{
    AgentId, BoundaryId, BoundaryPolicy, Context, ContextId, ContextType, EntityType, Operation,
    Permissions, TesseraError, TesseraResult, Timestamp,
};
use tracing::{debug, info, warn};

/// Default number of audit entries retained in memory.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: String,
}

impl AccessDecision {
    fn allow(reason: &str) -> Self {
        Self {
            allowed: true,
            reason: reason.to_string(),
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
        }
    }
}

/// One access decision taken under an audited boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub boundary_id: BoundaryId,
    pub context_id: ContextId,
    pub agent_id: AgentId,
    pub operation: Operation,
    pub allowed: bool,
    pub reason: String,
    pub at: Timestamp,
}

/// Keep-list or deny-list of dotted field paths, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "fields", rename_all = "kebab-case")]
pub enum FieldProjection {
    Expose(Vec<String>),
    Hide(Vec<String>),
}

/// A projected view of a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialContext {
    pub id: ContextId,
    pub context_type: ContextType,
    pub version: u64,
    pub fields: Map<String, Value>,
}

impl PartialContext {
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = self.fields.get(segments.next()?)?;
        segments.try_fold(first, |value, segment| value.get(segment))
    }
}

// ============================================================================
// FIELD PATHS
// ============================================================================

fn lookup<'a>(root: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(root.get(*first)?, |value, segment| value.get(*segment))
}

fn insert_at(root: &mut Map<String, Value>, path: &[&str], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            root.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let child = root
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                insert_at(map, rest, value);
            }
        }
    }
}

fn remove_at(root: &mut Map<String, Value>, path: &[&str]) {
    match path {
        [] => {}
        [leaf] => {
            root.remove(*leaf);
        }
        [head, rest @ ..] => {
            if let Some(Value::Object(map)) = root.get_mut(*head) {
                remove_at(map, rest);
            }
        }
    }
}

// ============================================================================
// STRATEGY
// ============================================================================

#[derive(Debug)]
pub struct IsolateStrategy {
    boundaries: DashMap<BoundaryId, BoundaryPolicy>,
    grants: DashMap<(ContextId, AgentId), Permissions>,
    audit: Mutex<VecDeque<AuditEntry>>,
    audit_capacity: usize,
}

impl Default for IsolateStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl IsolateStrategy {
    pub fn new(audit_capacity: usize) -> Self {
        Self {
            boundaries: DashMap::new(),
            grants: DashMap::new(),
            audit: Mutex::new(VecDeque::new()),
            audit_capacity: audit_capacity.max(1),
        }
    }

    // ------------------------------------------------------------------------
    // Boundary registry
    // ------------------------------------------------------------------------

    pub fn create_boundary(&self, policy: BoundaryPolicy) -> BoundaryId {
        let id = policy.id;
        info!(boundary_id = %id, name = %policy.name, audited = policy.audited, "boundary created");
        self.boundaries.insert(id, policy);
        id
    }

    pub fn remove_boundary(&self, id: BoundaryId) -> Option<BoundaryPolicy> {
        self.boundaries.remove(&id).map(|(_, policy)| policy)
    }

    /// A live boundary. Expired boundaries fail with `Expired`.
    pub fn get_boundary(&self, id: BoundaryId) -> TesseraResult<BoundaryPolicy> {
        let policy = self
            .boundaries
            .get(&id)
            .map(|b| b.clone())
            .ok_or_else(|| TesseraError::not_found(EntityType::Boundary, id))?;
        match policy.expires_at() {
            Some(expired_at) if expired_at <= Utc::now() => Err(TesseraError::Expired {
                key: format!("boundaries/{}", id),
                expired_at,
            }),
            _ => Ok(policy),
        }
    }

    pub fn boundaries(&self) -> Vec<BoundaryPolicy> {
        let mut out: Vec<BoundaryPolicy> = self.boundaries.iter().map(|b| b.clone()).collect();
        out.sort_by_key(|b| b.id);
        out
    }

    pub fn purge_expired_boundaries(&self, now: Timestamp) -> usize {
        let before = self.boundaries.len();
        self.boundaries.retain(|_, b| !b.is_expired(now));
        let purged = before - self.boundaries.len();
        if purged > 0 {
            info!(purged, "purged expired boundaries");
        }
        purged
    }

    fn live_boundary(&self, id: Option<BoundaryId>, now: Timestamp) -> Option<BoundaryPolicy> {
        id.and_then(|id| self.boundaries.get(&id).map(|b| b.clone()))
            .filter(|b| !b.is_expired(now))
    }

    // ------------------------------------------------------------------------
    // Share grants
    // ------------------------------------------------------------------------

    /// Add `permissions` to whatever the agent already holds on the context.
    pub fn grant(&self, context_id: ContextId, agent_id: AgentId, permissions: Permissions) {
        *self
            .grants
            .entry((context_id, agent_id))
            .or_insert_with(Permissions::empty) |= permissions;
        debug!(context_id = %context_id, agent_id = %agent_id, bits = permissions.bits(), "grant added");
    }

    pub fn revoke(&self, context_id: ContextId, agent_id: AgentId) -> bool {
        self.grants.remove(&(context_id, agent_id)).is_some()
    }

    /// Drop every grant held by `agent_id`. Returns how many were removed.
    pub fn revoke_agent(&self, agent_id: AgentId) -> usize {
        let before = self.grants.len();
        self.grants.retain(|(_, agent), _| *agent != agent_id);
        before - self.grants.len()
    }

    pub fn granted(&self, context_id: ContextId, agent_id: AgentId) -> Permissions {
        self.grants
            .get(&(context_id, agent_id))
            .map(|p| *p)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Access evaluation
    // ------------------------------------------------------------------------

    pub fn evaluate(
        &self,
        context: &Context,
        agent_id: AgentId,
        operation: Operation,
        now: Timestamp,
    ) -> AccessDecision {
        let required = Permissions::for_operation(operation);
        let boundary = self.live_boundary(context.metadata.boundary_id, now);
        let acl = context.grant_for(agent_id).unwrap_or_default();

        let decision = if boundary.as_ref().is_some_and(|b| b.deny.intersects(required)) {
            AccessDecision::deny("boundary denies operation")
        } else if acl.deny.intersects(required) {
            AccessDecision::deny("explicit deny")
        } else if context.metadata.owner == Some(agent_id) {
            AccessDecision::allow("owner")
        } else if boundary.as_ref().is_some_and(|b| !b.admits(agent_id)) {
            AccessDecision::deny("agent not admitted by boundary")
        } else {
            let granted = acl.allow | self.granted(context.id, agent_id);
            let effective = boundary.as_ref().map_or(granted, |b| granted & b.allow);
            if effective.contains(required) {
                AccessDecision::allow("granted")
            } else {
                AccessDecision::deny("no grant")
            }
        };

        if !decision.allowed {
            warn!(
                context_id = %context.id,
                agent_id = %agent_id,
                operation = %operation,
                reason = %decision.reason,
                "access denied"
            );
        }
        if let Some(boundary) = boundary.filter(|b| b.audited) {
            self.record_audit(AuditEntry {
                boundary_id: boundary.id,
                context_id: context.id,
                agent_id,
                operation,
                allowed: decision.allowed,
                reason: decision.reason.clone(),
                at: now,
            });
        }
        decision
    }

    pub fn check_access(&self, context: &Context, agent_id: AgentId, operation: Operation) -> bool {
        self.evaluate(context, agent_id, operation, Utc::now()).allowed
    }

    /// `AccessDenied` unless the agent may perform `operation`.
    pub fn ensure_access(
        &self,
        context: &Context,
        agent_id: AgentId,
        operation: Operation,
    ) -> TesseraResult<()> {
        if self.check_access(context, agent_id, operation) {
            Ok(())
        } else {
            Err(TesseraError::AccessDenied {
                agent_id,
                context_id: context.id,
                operation,
            })
        }
    }

    fn record_audit(&self, entry: AuditEntry) {
        info!(
            target: "tessera::audit",
            boundary_id = %entry.boundary_id,
            context_id = %entry.context_id,
            agent_id = %entry.agent_id,
            operation = %entry.operation,
            allowed = entry.allowed,
            reason = %entry.reason,
            "access decision"
        );
        if let Ok(mut log) = self.audit.lock() {
            if log.len() == self.audit_capacity {
                log.pop_front();
            }
            log.push_back(entry);
        }
    }

    /// Recent audit entries, oldest first.
    pub fn audit_trail(&self) -> Vec<AuditEntry> {
        self.audit
            .lock()
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Projection
    // ------------------------------------------------------------------------

    /// Project a context through a keep-list or deny-list of dotted paths
    /// over its serialized form (`content.title`, `metadata.tags`).
    pub fn view(&self, context: &Context, projection: &FieldProjection) -> TesseraResult<PartialContext> {
        let full = match serde_json::to_value(context) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => return Err(TesseraError::serialization("context projection", e)),
        };
        let fields = match projection {
            FieldProjection::Expose(paths) => {
                let mut kept = Map::new();
                for path in paths {
                    let segments: Vec<&str> = path.split('.').collect();
                    if let Some(value) = lookup(&full, &segments) {
                        insert_at(&mut kept, &segments, value.clone());
                    }
                }
                kept
            }
            FieldProjection::Hide(paths) => {
                let mut rest = full;
                for path in paths {
                    let segments: Vec<&str> = path.split('.').collect();
                    remove_at(&mut rest, &segments);
                }
                rest
            }
        };
        Ok(PartialContext {
            id: context.id,
            context_type: context.context_type,
            version: context.version,
            fields,
        })
    }

    pub fn expose_fields(&self, context: &Context, fields: &[&str]) -> TesseraResult<PartialContext> {
        self.view(
            context,
            &FieldProjection::Expose(fields.iter().map(|f| f.to_string()).collect()),
        )
    }

    pub fn hide_fields(&self, context: &Context, fields: &[&str]) -> TesseraResult<PartialContext> {
        self.view(
            context,
            &FieldProjection::Hide(fields.iter().map(|f| f.to_string()).collect()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tessera_core::{new_entity_id, AccessGrant, ContextMetadata, ErrorKind};

    fn context_with(meta: ContextMetadata) -> Context {
        Context::new(
            ContextType::Task,
            json!({ "title": "secret plan", "body": { "steps": 3, "notes": "n" } }),
            meta,
        )
    }

    #[test]
    fn test_default_deny() {
        let iso = IsolateStrategy::default();
        let ctx = context_with(ContextMetadata::default());
        assert!(!iso.check_access(&ctx, new_entity_id(), Operation::Read));
    }

    #[test]
    fn test_owner_allowed_but_explicit_deny_wins() {
        let iso = IsolateStrategy::default();
        let owner = new_entity_id();
        let ctx = context_with(ContextMetadata::default().with_owner(owner));
        assert!(iso.check_access(&ctx, owner, Operation::Delete));

        let ctx = context_with(
            ContextMetadata::default()
                .with_owner(owner)
                .with_grant(owner, AccessGrant::deny(Permissions::DELETE)),
        );
        assert!(!iso.check_access(&ctx, owner, Operation::Delete));
        assert!(iso.check_access(&ctx, owner, Operation::Read));
    }

    #[test]
    fn test_share_grant_capped_by_boundary() {
        let iso = IsolateStrategy::default();
        let agent = new_entity_id();
        let boundary = iso.create_boundary(BoundaryPolicy::new("team").with_allow(Permissions::READ));
        let mut ctx = context_with(ContextMetadata::default());
        ctx.metadata.boundary_id = Some(boundary);

        iso.grant(ctx.id, agent, Permissions::read_write());
        assert!(iso.check_access(&ctx, agent, Operation::Read));
        assert!(!iso.check_access(&ctx, agent, Operation::Write));

        assert!(iso.revoke(ctx.id, agent));
        assert!(!iso.check_access(&ctx, agent, Operation::Read));
    }

    #[test]
    fn test_boundary_deny_beats_acl_allow() {
        let iso = IsolateStrategy::default();
        let agent = new_entity_id();
        let boundary = iso.create_boundary(
            BoundaryPolicy::new("locked")
                .with_allow(Permissions::all())
                .with_deny(Permissions::WRITE),
        );
        let mut ctx = context_with(
            ContextMetadata::default().with_grant(agent, AccessGrant::allow(Permissions::all())),
        );
        ctx.metadata.boundary_id = Some(boundary);
        assert!(!iso.check_access(&ctx, agent, Operation::Write));
        assert!(iso.check_access(&ctx, agent, Operation::Read));
    }

    #[test]
    fn test_boundary_agent_list_and_ttl() {
        let iso = IsolateStrategy::default();
        let inside = new_entity_id();
        let outside = new_entity_id();
        let boundary = iso.create_boundary(
            BoundaryPolicy::new("pair")
                .with_agent(inside)
                .with_ttl(Duration::from_secs(60)),
        );
        let mut ctx = context_with(ContextMetadata::default());
        ctx.metadata.boundary_id = Some(boundary);
        iso.grant(ctx.id, inside, Permissions::READ);
        iso.grant(ctx.id, outside, Permissions::READ);

        let now = Utc::now();
        assert!(iso.evaluate(&ctx, inside, Operation::Read, now).allowed);
        assert!(!iso.evaluate(&ctx, outside, Operation::Read, now).allowed);

        // Once the boundary lapses only the grants apply.
        let later = now + chrono::Duration::seconds(120);
        assert!(iso.evaluate(&ctx, outside, Operation::Read, later).allowed);
        assert_eq!(iso.purge_expired_boundaries(later), 1);
        assert_eq!(
            iso.get_boundary(boundary).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_audited_boundary_records_decisions() {
        let iso = IsolateStrategy::new(2);
        let agent = new_entity_id();
        let boundary = iso.create_boundary(BoundaryPolicy::new("audited").with_audit(true));
        let mut ctx = context_with(ContextMetadata::default());
        ctx.metadata.boundary_id = Some(boundary);

        iso.check_access(&ctx, agent, Operation::Read);
        iso.grant(ctx.id, agent, Permissions::READ);
        iso.check_access(&ctx, agent, Operation::Read);
        iso.check_access(&ctx, agent, Operation::Share);

        let trail = iso.audit_trail();
        assert_eq!(trail.len(), 2);
        assert!(trail[0].allowed);
        assert!(!trail[1].allowed);
        assert_eq!(trail[1].operation, Operation::Share);
    }

    #[test]
    fn test_ensure_access_error() {
        let iso = IsolateStrategy::default();
        let ctx = context_with(ContextMetadata::default());
        let err = iso
            .ensure_access(&ctx, new_entity_id(), Operation::Write)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_revoke_agent_removes_all() {
        let iso = IsolateStrategy::default();
        let agent = new_entity_id();
        iso.grant(new_entity_id(), agent, Permissions::READ);
        iso.grant(new_entity_id(), agent, Permissions::READ);
        iso.grant(new_entity_id(), new_entity_id(), Permissions::READ);
        assert_eq!(iso.revoke_agent(agent), 2);
    }

    #[test]
    fn test_expose_and_hide_fields() {
        let iso = IsolateStrategy::default();
        let ctx = context_with(ContextMetadata::default().with_tags(["x"]));

        let exposed = iso
            .expose_fields(&ctx, &["content.title", "metadata.tags", "missing.path"])
            .unwrap();
        assert_eq!(exposed.field("content.title"), Some(&json!("secret plan")));
        assert!(exposed.field("content.body").is_none());
        assert!(exposed.field("relationships").is_none());
        assert_eq!(exposed.fields.len(), 2);

        let hidden = iso.hide_fields(&ctx, &["content.body.notes", "metadata"]).unwrap();
        assert!(hidden.field("metadata").is_none());
        assert!(hidden.field("content.body.notes").is_none());
        assert_eq!(hidden.field("content.body.steps"), Some(&json!(3)));
        assert_eq!(hidden.id, ctx.id);
    }
}
