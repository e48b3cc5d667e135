//! LMDB-backed archival store.
//!
//! Uses the heed crate (Rust bindings for LMDB) for a memory-mapped,
//! durable key-value store. LMDB calls block, so every operation runs on the
//! tokio blocking pool and the async caller only awaits the join handle.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions per call:
//! - Read transactions for `get` and `query`
//! - Write transactions for `put` and `delete`

use std::path::Path;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use tessera_core::{TesseraError, TesseraResult};

use crate::{missing, StorageAdapter, StorageFilter};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// The blocking task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for TesseraError {
    fn from(e: LmdbStoreError) -> Self {
        TesseraError::storage("lmdb", e)
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// LMDB archival store.
///
/// ```ignore
/// let store = LmdbStore::open("/var/lib/tessera/archive", 256)?;
/// store.put("archive/1", bytes).await?;
/// ```
#[derive(Clone)]
pub struct LmdbStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbStore {
    /// Open (or create) a store in `path` with a map size of `max_size_mb`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(path = %path.as_ref().display(), max_size_mb, "opened lmdb store");
        Ok(Self { env, db })
    }

    /// Run `f` against the environment on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> TesseraResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Env, Database<Bytes, Bytes>) -> Result<T, LmdbStoreError> + Send + 'static,
    {
        let env = self.env.clone();
        let db = self.db;
        tokio::task::spawn_blocking(move || f(env, db))
            .await
            .map_err(|e| LmdbStoreError::Join(e.to_string()))?
            .map_err(TesseraError::from)
    }
}

#[async_trait]
impl StorageAdapter for LmdbStore {
    fn backend_name(&self) -> &str {
        "lmdb"
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        let key = key.to_string();
        self.blocking(move |env, db| {
            let mut wtxn = env.write_txn().map_err(txn_err)?;
            db.put(&mut wtxn, key.as_bytes(), &value).map_err(txn_err)?;
            wtxn.commit().map_err(txn_err)
        })
        .await
    }

    async fn get(&self, key: &str) -> TesseraResult<Vec<u8>> {
        let owned = key.to_string();
        let found = self
            .blocking(move |env, db| {
                let rtxn = env.read_txn().map_err(txn_err)?;
                let value = db
                    .get(&rtxn, owned.as_bytes())
                    .map_err(txn_err)?
                    .map(<[u8]>::to_vec);
                Ok(value)
            })
            .await?;
        found.ok_or_else(|| missing(key))
    }

    async fn delete(&self, key: &str) -> TesseraResult<()> {
        let key = key.to_string();
        self.blocking(move |env, db| {
            let mut wtxn = env.write_txn().map_err(txn_err)?;
            db.delete(&mut wtxn, key.as_bytes()).map_err(txn_err)?;
            wtxn.commit().map_err(txn_err)
        })
        .await
    }

    async fn query(&self, filter: &StorageFilter) -> TesseraResult<Vec<String>> {
        let filter = filter.clone();
        self.blocking(move |env, db| {
            let rtxn = env.read_txn().map_err(txn_err)?;
            let needs_value = filter.needs_value();
            let mut keys = Vec::new();
            for entry in db.iter(&rtxn).map_err(txn_err)? {
                let (key, value) = entry.map_err(txn_err)?;
                let Ok(key) = std::str::from_utf8(key) else {
                    continue;
                };
                if filter.matches(key, needs_value.then_some(value)) {
                    keys.push(key.to_string());
                }
            }
            Ok(keys)
        })
        .await
    }

    async fn health_check(&self) -> TesseraResult<bool> {
        self.blocking(|env, _| env.read_txn().map(|_| true).map_err(txn_err))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ErrorKind;

    fn open_temp() -> (tempfile::TempDir, LmdbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbStore::open(dir.path(), 16).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (_dir, store) = open_temp();
        store.put("archive/1", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("archive/1").await.unwrap(), b"hello".to_vec());
        store.delete("archive/1").await.unwrap();
        assert_eq!(
            store.get("archive/1").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_query_prefix_in_key_order() {
        let (_dir, store) = open_temp();
        for key in ["archive/b", "archive/a", "compressed/a/v1"] {
            store.put(key, b"{}".to_vec()).await.unwrap();
        }
        let keys = store
            .query(&StorageFilter::prefix("archive/"))
            .await
            .unwrap();
        assert_eq!(keys, vec!["archive/a".to_string(), "archive/b".to_string()]);
    }

    #[tokio::test]
    async fn test_query_attribute_scans_values() {
        let (_dir, store) = open_temp();
        store
            .put("archive/1", br#"{"context_type":"task"}"#.to_vec())
            .await
            .unwrap();
        store
            .put("archive/2", br#"{"context_type":"session"}"#.to_vec())
            .await
            .unwrap();
        let keys = store
            .query(&StorageFilter::attribute("context_type", "session"))
            .await
            .unwrap();
        assert_eq!(keys, vec!["archive/2".to_string()]);
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LmdbStore::open(dir.path(), 16).unwrap();
            store.put("k", vec![1]).await.unwrap();
        }
        let store = LmdbStore::open(dir.path(), 16).unwrap();
        assert_eq!(store.get("k").await.unwrap(), vec![1]);
        assert!(store.health_check().await.unwrap());
    }

    #[test]
    fn test_error_maps_to_storage_unavailable() {
        let err: TesseraError = LmdbStoreError::Transaction("boom".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(err.to_string().contains("lmdb"));
    }
}
