//! Tessera Core - Entity Types
//!
//! Data model, lifecycle transition table, error taxonomy and configuration
//! shared by every other Tessera crate. Nothing here performs I/O.

mod agent;
mod boundary;
mod config;
mod conflict;
mod context;
mod enums;
mod error;
mod event;
mod identity;
mod lifecycle;
mod timeout;

pub use agent::*;
pub use boundary::*;
pub use config::*;
pub use conflict::*;
pub use context::*;
pub use enums::*;
pub use error::*;
pub use event::*;
pub use identity::*;
pub use lifecycle::*;
pub use timeout::*;

// ============================================================================
// STORAGE KEY LAYOUT
// ============================================================================

/// Key of a persisted context record.
pub fn context_key(id: ContextId) -> String {
    format!("contexts/{}", id)
}

/// Key of a persisted relationship record.
pub fn relationship_key(
    source: ContextId,
    target: ContextId,
    relationship_type: RelationshipType,
) -> String {
    format!("relationships/{}/{}/{}", source, target, relationship_type)
}

/// Prefix of all relationship records leaving `source`.
pub fn relationship_prefix(source: ContextId) -> String {
    format!("relationships/{}/", source)
}

/// Key of an archived context copy.
pub fn archive_key(id: ContextId) -> String {
    format!("archive/{}", id)
}

/// Key of a compressed blob for one version of a context. `attempt` keeps
/// concurrent compressions of the same version from sharing a key.
pub fn compressed_key(id: ContextId, version: u64, attempt: EntityId) -> String {
    format!("compressed/{}/v{}/{}", id, version, attempt)
}
