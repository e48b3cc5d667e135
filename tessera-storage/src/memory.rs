//! Hot in-memory key-value store

use crate::{missing, StorageAdapter, StorageFilter};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tessera_core::{TesseraError, TesseraResult};

/// In-memory key-value store.
///
/// Availability and latency can be toggled at runtime so callers can exercise
/// storage-failure and timeout paths.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    name: String,
    records: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    available: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::new(RwLock::new(BTreeMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            latency_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every subsequent call fail with `StorageUnavailable` (or recover).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn gate(&self) -> TesseraResult<()> {
        let ms = self.latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TesseraError::storage(&self.name, "backend marked unavailable"))
        }
    }

    fn poisoned(&self) -> TesseraError {
        TesseraError::storage(&self.name, "storage lock poisoned")
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStore {
    fn backend_name(&self) -> &str {
        &self.name
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        self.gate().await?;
        let mut records = self.records.write().map_err(|_| self.poisoned())?;
        records.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> TesseraResult<Vec<u8>> {
        self.gate().await?;
        let records = self.records.read().map_err(|_| self.poisoned())?;
        records.get(key).cloned().ok_or_else(|| missing(key))
    }

    async fn delete(&self, key: &str) -> TesseraResult<()> {
        self.gate().await?;
        let mut records = self.records.write().map_err(|_| self.poisoned())?;
        records.remove(key);
        Ok(())
    }

    async fn query(&self, filter: &StorageFilter) -> TesseraResult<Vec<String>> {
        self.gate().await?;
        let records = self.records.read().map_err(|_| self.poisoned())?;
        let needs_value = filter.needs_value();
        Ok(records
            .iter()
            .filter(|(k, v)| filter.matches(k, needs_value.then_some(v.as_slice())))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn health_check(&self) -> TesseraResult<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ErrorKind;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = InMemoryStore::new();
        store.put("a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), vec![1, 2, 3]);
        store.delete("a").await.unwrap();
        let err = store.get("a").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        // Deleting again is fine.
        store.delete("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_query_prefix_sorted() {
        let store = InMemoryStore::new();
        for key in ["contexts/b", "contexts/a", "shares/x"] {
            store.put(key, vec![]).await.unwrap();
        }
        let keys = store.query(&StorageFilter::prefix("contexts/")).await.unwrap();
        assert_eq!(keys, vec!["contexts/a".to_string(), "contexts/b".to_string()]);
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert_eq!(
            store.put("a", vec![]).await.unwrap_err().kind(),
            ErrorKind::StorageUnavailable
        );
        assert_eq!(
            store.query(&StorageFilter::All).await.unwrap_err().kind(),
            ErrorKind::StorageUnavailable
        );
        assert!(!store.health_check().await.unwrap());
        store.set_available(true);
        store.put("a", vec![]).await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_records() {
        let store = InMemoryStore::new();
        let other = store.clone();
        store.put("k", vec![7]).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), vec![7]);
        assert_eq!(other.len(), 1);
    }

    #[tokio::test]
    async fn test_latency_delays_calls() {
        let store = InMemoryStore::new();
        store.set_latency(Duration::from_millis(30));
        let started = std::time::Instant::now();
        store.put("k", vec![]).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
