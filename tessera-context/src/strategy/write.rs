//! Write strategy: externalize contexts into named namespaces.
//!
//! An externalized context is stored as a self-describing record under
//! `{namespace}/{context}/v{version}`. The returned [`ContextReference`]
//! carries everything needed to resolve it again (key, expiry, schema
//! version, content hash) without consulting the repository.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tessera_core::{
    compute_content_hash, content_hash_hex, Context, ContextId, StorageTarget, TesseraError,
    TesseraResult, Timestamp, ValidationError,
};
use tessera_storage::{get_json, load_prefix, put_json, SharedStorage};
use tracing::{debug, info};

/// Handle to an externalized context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextReference {
    pub namespace: String,
    pub key: String,
    pub target: StorageTarget,
    pub context_id: ContextId,
    pub version: u64,
    pub schema_version: u32,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    /// Hex SHA-256 of the serialized context.
    pub content_hash: String,
    pub size_bytes: usize,
}

impl ContextReference {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExternalRecord {
    reference: ContextReference,
    payload: String,
}

pub fn reference_key(target: StorageTarget, context_id: ContextId, version: u64) -> String {
    format!("{}/{}/v{}", target.namespace(), context_id, version)
}

/// Stores and resolves externalized contexts.
#[derive(Clone)]
pub struct WriteStrategy {
    store: SharedStorage,
    default_ttl: Option<Duration>,
}

impl std::fmt::Debug for WriteStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteStrategy")
            .field("store", &self.store.backend_name())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl WriteStrategy {
    pub fn new(store: SharedStorage, default_ttl: Option<Duration>) -> Self {
        Self { store, default_ttl }
    }

    /// Externalize `context` into `target`. `ttl` overrides the default TTL.
    pub async fn store_external(
        &self,
        context: &Context,
        target: StorageTarget,
        ttl: Option<Duration>,
    ) -> TesseraResult<ContextReference> {
        let payload = serde_json::to_string(context)
            .map_err(|e| TesseraError::serialization("externalized context", e))?;
        let now = Utc::now();
        let expires_at = ttl
            .or(self.default_ttl)
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        let reference = ContextReference {
            namespace: target.namespace().to_string(),
            key: reference_key(target, context.id, context.version),
            target,
            context_id: context.id,
            version: context.version,
            schema_version: context.metadata.schema_version,
            created_at: now,
            expires_at,
            content_hash: content_hash_hex(&compute_content_hash(payload.as_bytes())),
            size_bytes: payload.len(),
        };
        let record = ExternalRecord {
            reference: reference.clone(),
            payload,
        };
        put_json(self.store.as_ref(), &reference.key, &record).await?;
        info!(
            context_id = %context.id,
            key = %reference.key,
            size_bytes = reference.size_bytes,
            "context externalized"
        );
        Ok(reference)
    }

    /// Resolve a reference back into the context it captured.
    pub async fn retrieve_external(&self, reference: &ContextReference) -> TesseraResult<Context> {
        self.retrieve_at(reference, Utc::now()).await
    }

    /// Like [`WriteStrategy::retrieve_external`] with an explicit clock.
    pub async fn retrieve_at(
        &self,
        reference: &ContextReference,
        now: Timestamp,
    ) -> TesseraResult<Context> {
        expiry_check(reference, now)?;
        let record: ExternalRecord = get_json(self.store.as_ref(), &reference.key).await?;
        expiry_check(&record.reference, now)?;

        let actual = content_hash_hex(&compute_content_hash(record.payload.as_bytes()));
        if actual != reference.content_hash {
            return Err(ValidationError::IntegrityMismatch {
                key: reference.key.clone(),
                expected: reference.content_hash.clone(),
                actual,
            }
            .into());
        }
        debug!(key = %reference.key, "externalized context resolved");
        serde_json::from_str(&record.payload)
            .map_err(|e| TesseraError::storage(self.store.backend_name(), e))
    }

    /// Look a reference up by key.
    pub async fn lookup(&self, key: &str) -> TesseraResult<ContextReference> {
        let record: ExternalRecord = get_json(self.store.as_ref(), key).await?;
        Ok(record.reference)
    }

    pub async fn release(&self, reference: &ContextReference) -> TesseraResult<()> {
        self.store.delete(&reference.key).await?;
        debug!(key = %reference.key, "externalized context released");
        Ok(())
    }

    /// All references currently stored in `target`, in key order.
    pub async fn list_references(&self, target: StorageTarget) -> TesseraResult<Vec<ContextReference>> {
        let prefix = format!("{}/", target.namespace());
        let rows: Vec<(String, ExternalRecord)> = load_prefix(self.store.as_ref(), &prefix).await?;
        Ok(rows.into_iter().map(|(_, r)| r.reference).collect())
    }

    /// Delete references in `target` whose TTL has passed. Returns how many.
    pub async fn purge_expired(&self, target: StorageTarget, now: Timestamp) -> TesseraResult<usize> {
        let mut purged = 0;
        for reference in self.list_references(target).await? {
            if reference.is_expired(now) {
                self.store.delete(&reference.key).await?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!(namespace = target.namespace(), purged, "purged expired references");
        }
        Ok(purged)
    }
}

fn expiry_check(reference: &ContextReference, now: Timestamp) -> TesseraResult<()> {
    match reference.expires_at {
        Some(expired_at) if expired_at <= now => Err(TesseraError::Expired {
            key: reference.key.clone(),
            expired_at,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tessera_core::{ContextMetadata, ContextType, ErrorKind};
    use tessera_storage::{InMemoryStore, StorageAdapter};

    fn strategy() -> (WriteStrategy, InMemoryStore) {
        let store = InMemoryStore::new();
        (WriteStrategy::new(Arc::new(store.clone()), None), store)
    }

    fn context() -> Context {
        Context::new(
            ContextType::Task,
            json!({ "title": "external" }),
            ContextMetadata::default().with_tags(["ops"]),
        )
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let (write, _) = strategy();
        let ctx = context();
        let reference = write
            .store_external(&ctx, StorageTarget::Scratchpad, None)
            .await
            .unwrap();
        assert_eq!(reference.namespace, "scratchpad");
        assert_eq!(reference.key, format!("scratchpad/{}/v1", ctx.id));
        assert_eq!(reference.content_hash.len(), 64);

        let back = write.retrieve_external(&reference).await.unwrap();
        assert_eq!(back, ctx);
    }

    #[tokio::test]
    async fn test_expired_reference() {
        let (write, _) = strategy();
        let reference = write
            .store_external(&context(), StorageTarget::Memory, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        let later = Utc::now() + chrono::Duration::seconds(120);
        let err = write.retrieve_at(&reference, later).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Expired);

        assert_eq!(
            write.purge_expired(StorageTarget::Memory, later).await.unwrap(),
            1
        );
        assert!(write
            .list_references(StorageTarget::Memory)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let store = InMemoryStore::new();
        let write = WriteStrategy::new(Arc::new(store), Some(Duration::from_secs(5)));
        let reference = write
            .store_external(&context(), StorageTarget::StateObject, None)
            .await
            .unwrap();
        assert!(reference.expires_at.is_some());
        assert_eq!(reference.namespace, "state");
    }

    #[tokio::test]
    async fn test_tampered_reference_fails_integrity() {
        let (write, _) = strategy();
        let mut reference = write
            .store_external(&context(), StorageTarget::Scratchpad, None)
            .await
            .unwrap();
        reference.content_hash = "0".repeat(64);
        let err = write.retrieve_external(&reference).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn test_release_and_lookup() {
        let (write, store) = strategy();
        let reference = write
            .store_external(&context(), StorageTarget::Scratchpad, None)
            .await
            .unwrap();
        assert_eq!(write.lookup(&reference.key).await.unwrap(), reference);
        write.release(&reference).await.unwrap();
        assert!(!store.exists(&reference.key).await.unwrap());
        let err = write.retrieve_external(&reference).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces() {
        let (write, store) = strategy();
        store.set_available(false);
        let err = write
            .store_external(&context(), StorageTarget::Scratchpad, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    }
}
