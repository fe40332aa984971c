//! In-memory persistent store
//!
//! Keeps records in a process-local map. Used by the all-in-one role and by
//! tests; a durable store plugs in through the same trait.

use crate::error::Result;
use crate::interfaces::{PersistentStore, RecordKind};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// [`PersistentStore`] backed by a map.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<(RecordKind, String), serde_json::Value>>,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records of `kind`
    pub async fn count(&self, kind: RecordKind) -> usize {
        self.records.read().await.keys().filter(|(k, _)| *k == kind).count()
    }
}

#[async_trait::async_trait]
impl PersistentStore for InMemoryStore {
    async fn put(&self, kind: RecordKind, key: &str, value: serde_json::Value) -> Result<()> {
        self.records.write().await.insert((kind, key.to_string()), value);
        Ok(())
    }

    async fn get(&self, kind: RecordKind, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.records.read().await.get(&(kind, key.to_string())).cloned())
    }

    async fn delete(&self, kind: RecordKind, key: &str) -> Result<()> {
        self.records.write().await.remove(&(kind, key.to_string()));
        Ok(())
    }

    async fn list(&self, kind: RecordKind) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryStore::new();
        store
            .put(RecordKind::Node, "n1", serde_json::json!({"name": "n1"}))
            .await
            .expect("put");
        assert_eq!(store.count(RecordKind::Node).await, 1);
        assert!(store.get(RecordKind::Volume, "n1").await.expect("get").is_none());

        store.delete(RecordKind::Node, "n1").await.expect("delete");
        store.delete(RecordKind::Node, "n1").await.expect("second delete");
        assert!(store.list(RecordKind::Node).await.expect("list").is_empty());
    }
}
