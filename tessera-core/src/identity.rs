//! Identity types for Tessera entities

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Entity identifier using UUIDv7 for timestamp-sortable IDs.
/// UUIDv7 embeds a Unix timestamp, making IDs naturally sortable by creation time.
pub type EntityId = Uuid;

/// Identifier of a context. Immutable once assigned.
pub type ContextId = EntityId;

/// Identifier of a registered agent.
pub type AgentId = EntityId;

/// Identifier of an isolation boundary.
pub type BoundaryId = EntityId;

/// Identifier of an agent subscription or event bus subscriber.
pub type SubscriptionId = EntityId;

/// Identifier of a detected conflict.
pub type ConflictId = EntityId;

/// Identifier of a published event.
pub type EventId = EntityId;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Duration in milliseconds for TTL values that get persisted.
pub type DurationMs = i64;

/// SHA-256 content hash for integrity verification.
pub type ContentHash = [u8; 32];

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Compute SHA-256 hash of content.
pub fn compute_content_hash(content: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Hex form of a content hash, used in persisted references.
pub fn content_hash_hex(hash: &ContentHash) -> String {
    hex::encode(hash)
}
