//! Permissions and isolation boundaries

use crate::{new_entity_id, AgentId, BoundaryId, Operation, Timestamp};
use bitflags::bitflags;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

// ============================================================================
// PERMISSIONS
// ============================================================================

bitflags! {
    /// Permission bits checked by the isolation layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 0b0000_0001;
        const WRITE = 0b0000_0010;
        const SHARE = 0b0000_0100;
        const DELETE = 0b0000_1000;
        const COMPRESS = 0b0001_0000;
        const ADMIN = 0b0010_0000;
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::empty()
    }
}

impl Permissions {
    /// Read and write, the usual grant for collaborating agents.
    pub fn read_write() -> Self {
        Self::READ | Self::WRITE
    }

    /// The bit an operation requires.
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Read => Self::READ,
            Operation::Write => Self::WRITE,
            Operation::Share => Self::SHARE,
            Operation::Delete => Self::DELETE,
            Operation::Compress => Self::COMPRESS,
            Operation::Admin => Self::ADMIN,
        }
    }

    pub fn permits(&self, operation: Operation) -> bool {
        self.contains(Self::for_operation(operation))
    }
}

impl Serialize for Permissions {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Permissions {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u8::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid Permissions bits: {:#04x}", bits))
        })
    }
}

/// Per-agent access control entry stored on a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessGrant {
    pub allow: Permissions,
    pub deny: Permissions,
}

impl AccessGrant {
    pub fn allow(allow: Permissions) -> Self {
        Self {
            allow,
            deny: Permissions::empty(),
        }
    }

    pub fn deny(deny: Permissions) -> Self {
        Self {
            allow: Permissions::empty(),
            deny,
        }
    }
}

// ============================================================================
// BOUNDARY POLICY
// ============================================================================

/// A named isolation boundary.
///
/// `allow` caps what any agent may do inside the boundary; `deny` removes
/// operations outright, including for the owner. An empty `allowed_agents`
/// set places no restriction on which agents may enter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPolicy {
    pub id: BoundaryId,
    pub name: String,
    pub allow: Permissions,
    pub deny: Permissions,
    pub allowed_agents: BTreeSet<AgentId>,
    /// Informational; payload encryption is left to the storage backend
    pub encrypted: bool,
    pub audited: bool,
    pub ttl: Option<Duration>,
    pub created_at: Timestamp,
}

impl BoundaryPolicy {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_entity_id(),
            name: name.into(),
            allow: Permissions::READ,
            deny: Permissions::empty(),
            allowed_agents: BTreeSet::new(),
            encrypted: false,
            audited: false,
            ttl: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_allow(mut self, allow: Permissions) -> Self {
        self.allow = allow;
        self
    }

    pub fn with_deny(mut self, deny: Permissions) -> Self {
        self.deny = deny;
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.allowed_agents.insert(agent_id);
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_audit(mut self, audited: bool) -> Self {
        self.audited = audited;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Instant after which the boundary no longer applies.
    pub fn expires_at(&self) -> Option<Timestamp> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Whether the agent list lets `agent_id` in at all.
    pub fn admits(&self, agent_id: AgentId) -> bool {
        self.allowed_agents.is_empty() || self.allowed_agents.contains(&agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_serde_as_bits() {
        let p = Permissions::READ | Permissions::SHARE;
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "5");
        let back: Permissions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_permissions_reject_unknown_bits() {
        assert!(serde_json::from_str::<Permissions>("255").is_err());
    }

    #[test]
    fn test_permits_operation() {
        let p = Permissions::read_write();
        assert!(p.permits(Operation::Read));
        assert!(p.permits(Operation::Write));
        assert!(!p.permits(Operation::Delete));
    }

    #[test]
    fn test_boundary_ttl_expiry() {
        let boundary = BoundaryPolicy::new("short").with_ttl(Duration::from_secs(60));
        let later = boundary.created_at + chrono::Duration::seconds(61);
        assert!(!boundary.is_expired(boundary.created_at));
        assert!(boundary.is_expired(later));
    }

    #[test]
    fn test_boundary_without_ttl_never_expires() {
        let boundary = BoundaryPolicy::new("forever");
        let later = boundary.created_at + chrono::Duration::days(3650);
        assert!(!boundary.is_expired(later));
    }

    #[test]
    fn test_admits_respects_agent_list() {
        let a = new_entity_id();
        let b = new_entity_id();
        let open = BoundaryPolicy::new("open");
        assert!(open.admits(a));
        let closed = BoundaryPolicy::new("closed").with_agent(a);
        assert!(closed.admits(a));
        assert!(!closed.admits(b));
    }
}
