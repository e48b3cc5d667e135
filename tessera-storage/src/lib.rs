//! Tessera Storage - Storage Adapter Contract and Backends
//!
//! The engine talks to every backing store through [`StorageAdapter`]:
//! opaque bytes under string keys, plus a key query. Three backends ship here:
//!
//! - [`InMemoryStore`]: hot key-value store
//! - [`IndexedStore`]: in-memory store with a secondary index over JSON fields
//! - [`LmdbStore`]: LMDB archival store (memory-mapped, durable)
//!
//! No transactional guarantee is assumed across adapters.

mod filter;
mod indexed;
mod lmdb;
mod memory;

pub use filter::{json_field_values, StorageFilter};
pub use indexed::IndexedStore;
pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tessera_core::{EntityType, TesseraError, TesseraResult};

// ============================================================================
// STORAGE ADAPTER CONTRACT
// ============================================================================

/// Uniform get/put/delete/query contract over a backing store.
///
/// Backend faults surface as `TesseraError::StorageUnavailable`. A missing key
/// on `get` is `TesseraError::NotFound`; `delete` of a missing key succeeds.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Short backend name used in errors and logs.
    fn backend_name(&self) -> &str;

    async fn put(&self, key: &str, value: Vec<u8>) -> TesseraResult<()>;

    async fn get(&self, key: &str) -> TesseraResult<Vec<u8>>;

    async fn delete(&self, key: &str) -> TesseraResult<()>;

    /// Keys matching `filter`, in ascending key order.
    async fn query(&self, filter: &StorageFilter) -> TesseraResult<Vec<String>>;

    async fn exists(&self, key: &str) -> TesseraResult<bool> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(TesseraError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn health_check(&self) -> TesseraResult<bool> {
        Ok(true)
    }
}

/// Shared handle to a storage adapter.
pub type SharedStorage = Arc<dyn StorageAdapter>;

// ============================================================================
// JSON HELPERS
// ============================================================================

/// Serialize `value` as JSON and store it under `key`.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn StorageAdapter,
    key: &str,
    value: &T,
) -> TesseraResult<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| TesseraError::serialization(key, e))?;
    store.put(key, bytes).await
}

/// Load and deserialize the JSON record under `key`.
pub async fn get_json<T: DeserializeOwned>(store: &dyn StorageAdapter, key: &str) -> TesseraResult<T> {
    let bytes = store.get(key).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| TesseraError::storage(store.backend_name(), format!("decode {}: {}", key, e)))
}

/// Load every JSON record whose key starts with `prefix`.
pub async fn load_prefix<T: DeserializeOwned>(
    store: &dyn StorageAdapter,
    prefix: &str,
) -> TesseraResult<Vec<(String, T)>> {
    let keys = store.query(&StorageFilter::prefix(prefix)).await?;
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        match get_json(store, &key).await {
            Ok(value) => out.push((key, value)),
            // Deleted between query and get.
            Err(TesseraError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

pub(crate) fn missing(key: &str) -> TesseraError {
    TesseraError::not_found(EntityType::Record, key)
}
