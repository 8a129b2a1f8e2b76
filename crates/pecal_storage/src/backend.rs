//! Key-value store trait definition.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Durable on-device key-value storage.
///
/// Stores are **opaque**. Session records, the offline queue and draft
/// slots are serialized by their owners before they reach the store.
///
/// # Invariants
///
/// - `get` returns exactly the value last passed to `set` for that key
/// - `set` replaces the whole value atomically
/// - `remove` on a missing key succeeds
///
/// # Implementors
///
/// - [`super::MemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, or `None` if absent.
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: String) -> StorageResult<()>;

    /// Removes the value stored under `key`.
    async fn remove(&self, key: &str) -> StorageResult<()>;
}

/// JSON helpers layered over any [`KeyValueStore`].
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    /// Reads and decodes a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if the stored text is not valid
    /// JSON for `T`.
    async fn get_json<T>(&self, key: &str) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StorageError::Corrupted {
                key: key.to_string(),
                message: err.to_string(),
            })
    }

    /// Encodes `value` as JSON and stores it.
    async fn set_json<T>(&self, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let raw = serde_json::to_string(value).map_err(|err| StorageError::Encode {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        self.set(key, raw).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}
