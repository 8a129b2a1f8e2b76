//! In-memory key-value store for testing.

use crate::backend::KeyValueStore;
use crate::error::StorageResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// An in-memory key-value store.
///
/// This store keeps all values in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral clients that don't need persistence
///
/// Cloning the entries with [`MemoryStore::snapshot`] and feeding them to
/// [`MemoryStore::with_entries`] simulates a process restart.
///
/// # Example
///
/// ```rust
/// use pecal_storage::MemoryStore;
///
/// let store = MemoryStore::with_entries([("k".to_string(), "v".to_string())]);
/// assert_eq!(store.keys(), vec!["k".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with pre-existing entries.
    ///
    /// Useful for testing restore scenarios.
    #[must_use]
    pub fn with_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Returns a sorted copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns all keys in sorted order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::KeyValueStoreExt;
    use crate::error::StorageError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Marker {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn memory_new_is_empty() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_set_replaces_value() {
        let store = MemoryStore::new();
        store.set("k", "one".into()).await.unwrap();
        store.set("k", "two".into()).await.unwrap();

        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("two"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn memory_remove_missing_key_succeeds() {
        let store = MemoryStore::new();
        store.remove("never-written").await.unwrap();

        store.set("k", "v".into()).await.unwrap();
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_with_entries_survives_reload() {
        let store = MemoryStore::new();
        store.set("a", "1".into()).await.unwrap();
        store.set("b", "2".into()).await.unwrap();

        let reloaded = MemoryStore::with_entries(store.snapshot());
        assert_eq!(reloaded.keys(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(reloaded.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn memory_json_helpers() {
        let store = MemoryStore::new();
        let marker = Marker {
            name: "queue".into(),
            count: 3,
        };
        store.set_json("marker", &marker).await.unwrap();

        let loaded: Option<Marker> = store.get_json("marker").await.unwrap();
        assert_eq!(loaded, Some(marker));
    }

    #[tokio::test]
    async fn memory_json_corruption_is_reported() {
        let store = MemoryStore::with_entries([("marker".to_string(), "{not json".to_string())]);
        let result: StorageResult<Option<Marker>> = store.get_json("marker").await;
        assert!(matches!(result, Err(StorageError::Corrupted { .. })));
    }
}
