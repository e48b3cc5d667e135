//! Indexed query store
//!
//! Keeps records in memory and maintains a secondary index over a fixed set
//! of dotted JSON fields, so attribute queries on those fields avoid a scan.

use crate::filter::json_field_values;
use crate::{missing, StorageAdapter, StorageFilter};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tessera_core::{TesseraError, TesseraResult};

/// Fields indexed by [`IndexedStore::new`].
pub const DEFAULT_INDEXED_FIELDS: &[&str] = &[
    "context_type",
    "state",
    "metadata.owner",
    "metadata.tags",
    "metadata.boundary_id",
    "context_id",
    "agent_id",
];

#[derive(Debug, Default)]
struct IndexInner {
    records: BTreeMap<String, Vec<u8>>,
    /// field -> value -> keys
    index: HashMap<String, HashMap<String, BTreeSet<String>>>,
}

impl IndexInner {
    fn unindex(&mut self, key: &str, fields: &[String]) {
        let Some(old) = self.records.get(key) else {
            return;
        };
        let Ok(json) = serde_json::from_slice::<Value>(old) else {
            return;
        };
        for field in fields {
            let Some(by_value) = self.index.get_mut(field) else {
                continue;
            };
            for value in json_field_values(&json, field) {
                if let Some(keys) = by_value.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        by_value.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&mut self, key: &str, value: &[u8], fields: &[String]) {
        let Ok(json) = serde_json::from_slice::<Value>(value) else {
            return;
        };
        for field in fields {
            for v in json_field_values(&json, field) {
                self.index
                    .entry(field.clone())
                    .or_default()
                    .entry(v)
                    .or_default()
                    .insert(key.to_string());
            }
        }
    }
}

/// In-memory store with a secondary index over JSON fields.
#[derive(Debug, Clone)]
pub struct IndexedStore {
    fields: Arc<Vec<String>>,
    inner: Arc<RwLock<IndexInner>>,
}

impl Default for IndexedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexedStore {
    pub fn new() -> Self {
        Self::with_fields(DEFAULT_INDEXED_FIELDS.iter().copied())
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Arc::new(fields.into_iter().map(Into::into).collect()),
            inner: Arc::new(RwLock::new(IndexInner::default())),
        }
    }

    pub fn is_indexed(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    /// Number of distinct values indexed for `field`.
    pub fn cardinality(&self, field: &str) -> usize {
        self.inner
            .read()
            .ok()
            .and_then(|inner| inner.index.get(field).map(HashMap::len))
            .unwrap_or(0)
    }

    fn poisoned() -> TesseraError {
        TesseraError::storage("indexed", "index lock poisoned")
    }

    fn evaluate(inner: &IndexInner, fields: &[String], filter: &StorageFilter) -> BTreeSet<String> {
        match filter {
            StorageFilter::Attribute { field, value } if fields.contains(field) => inner
                .index
                .get(field)
                .and_then(|by_value| by_value.get(value))
                .cloned()
                .unwrap_or_default(),
            StorageFilter::And(parts) => {
                let mut sets = parts.iter().map(|p| Self::evaluate(inner, fields, p));
                let Some(first) = sets.next() else {
                    return inner.records.keys().cloned().collect();
                };
                sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect())
            }
            other => inner
                .records
                .iter()
                .filter(|(k, v)| other.matches(k, Some(v.as_slice())))
                .map(|(k, _)| k.clone())
                .collect(),
        }
    }
}

#[async_trait]
impl StorageAdapter for IndexedStore {
    fn backend_name(&self) -> &str {
        "indexed"
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> TesseraResult<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner.unindex(key, &self.fields);
        inner.index(key, &value, &self.fields);
        inner.records.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> TesseraResult<Vec<u8>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        inner.records.get(key).cloned().ok_or_else(|| missing(key))
    }

    async fn delete(&self, key: &str) -> TesseraResult<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner.unindex(key, &self.fields);
        inner.records.remove(key);
        Ok(())
    }

    async fn query(&self, filter: &StorageFilter) -> TesseraResult<Vec<String>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(Self::evaluate(&inner, &self.fields, filter)
            .into_iter()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn put(store: &IndexedStore, key: &str, value: Value) {
        store
            .put(key, serde_json::to_vec(&value).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_attribute_query_uses_index() {
        let store = IndexedStore::new();
        put(&store, "contexts/1", json!({ "context_type": "task" })).await;
        put(&store, "contexts/2", json!({ "context_type": "workflow" })).await;
        put(&store, "contexts/3", json!({ "context_type": "task" })).await;

        let keys = store
            .query(&StorageFilter::attribute("context_type", "task"))
            .await
            .unwrap();
        assert_eq!(keys, vec!["contexts/1".to_string(), "contexts/3".to_string()]);
        assert_eq!(store.cardinality("context_type"), 2);
    }

    #[tokio::test]
    async fn test_reindex_on_overwrite_and_delete() {
        let store = IndexedStore::new();
        put(&store, "c", json!({ "metadata": { "tags": ["a", "b"] } })).await;
        put(&store, "c", json!({ "metadata": { "tags": ["b"] } })).await;

        let a = store
            .query(&StorageFilter::attribute("metadata.tags", "a"))
            .await
            .unwrap();
        assert!(a.is_empty());
        let b = store
            .query(&StorageFilter::attribute("metadata.tags", "b"))
            .await
            .unwrap();
        assert_eq!(b, vec!["c".to_string()]);

        store.delete("c").await.unwrap();
        assert_eq!(store.cardinality("metadata.tags"), 0);
    }

    #[tokio::test]
    async fn test_unindexed_field_falls_back_to_scan() {
        let store = IndexedStore::with_fields(["context_type"]);
        assert!(!store.is_indexed("metadata.priority"));
        put(&store, "x", json!({ "metadata": { "priority": 7 } })).await;
        let keys = store
            .query(&StorageFilter::attribute("metadata.priority", "7"))
            .await
            .unwrap();
        assert_eq!(keys, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_and_intersects_prefix_and_index() {
        let store = IndexedStore::new();
        put(&store, "contexts/1", json!({ "context_type": "task" })).await;
        put(&store, "archive/1", json!({ "context_type": "task" })).await;
        let filter =
            StorageFilter::prefix("contexts/").and(StorageFilter::attribute("context_type", "task"));
        let keys = store.query(&filter).await.unwrap();
        assert_eq!(keys, vec!["contexts/1".to_string()]);
    }

    #[tokio::test]
    async fn test_non_json_values_are_stored_but_not_indexed() {
        let store = IndexedStore::new();
        store.put("blob", vec![0xff, 0x00]).await.unwrap();
        assert_eq!(store.get("blob").await.unwrap(), vec![0xff, 0x00]);
        assert_eq!(
            store.query(&StorageFilter::All).await.unwrap(),
            vec!["blob".to_string()]
        );
    }
}
