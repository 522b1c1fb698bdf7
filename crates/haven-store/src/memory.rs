//! In-memory backing store

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::{BackingStore, StoreResult};

/// Process-local store. Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    items: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Keys starting with `prefix`
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.items
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Raw access for corruption tests
    pub fn raw_get(&self, key: &str) -> Option<String> {
        self.items.read().get(key).cloned()
    }

    pub fn raw_put(&self, key: &str, value: impl Into<String>) {
        self.items.write().insert(key.to_string(), value.into());
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: String) -> StoreResult<()> {
        self.items.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> StoreResult<()> {
        self.items.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self.keys_with_prefix(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CHECKPOINT_PREFIX;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();
        store.set_item("checkpoint_1", "blob".into()).await.unwrap();
        store.set_item("backup_1", "blob".into()).await.unwrap();

        assert_eq!(store.get_item("checkpoint_1").await.unwrap().as_deref(), Some("blob"));
        assert_eq!(store.keys_with_prefix(CHECKPOINT_PREFIX).len(), 1);

        store.remove_item("checkpoint_1").await.unwrap();
        assert_eq!(store.get_item("checkpoint_1").await.unwrap(), None);
        assert_eq!(store.len(), 1);
        assert_eq!(store.list_keys("backup_").await.unwrap(), vec!["backup_1".to_string()]);
    }

    #[tokio::test]
    async fn test_clones_share_items() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set_item("k", "v".into()).await.unwrap();
        assert_eq!(other.raw_get("k").as_deref(), Some("v"));
    }
}
