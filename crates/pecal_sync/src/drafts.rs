//! Per-workspace persisted slots: memo drafts and memo metadata.

use crate::error::SyncResult;
use crate::guard::VersionMarker;
use pecal_storage::{KeyValueStore, KeyValueStoreExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// A typed JSON value stored under `<namespace>:<workspace id>`.
pub struct WorkspaceSlot<T> {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
    _value: PhantomData<fn() -> T>,
}

impl<T> WorkspaceSlot<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Creates a slot family under `namespace`.
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            _value: PhantomData,
        }
    }

    /// Storage key for a workspace.
    pub fn key(&self, workspace_id: i64) -> String {
        format!("{}:{}", self.namespace, workspace_id)
    }

    /// Loads the value for a workspace. Unreadable values count as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn load(&self, workspace_id: i64) -> SyncResult<Option<T>> {
        let key = self.key(workspace_id);
        match self.store.get_json::<T>(&key).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_corruption() => {
                warn!(key = %key, error = %err, "ignoring unreadable workspace slot");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stores the value for a workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn save(&self, workspace_id: i64, value: &T) -> SyncResult<()> {
        self.store.set_json(&self.key(workspace_id), value).await?;
        Ok(())
    }

    /// Removes the value for a workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    pub async fn clear(&self, workspace_id: i64) -> SyncResult<()> {
        self.store.remove(&self.key(workspace_id)).await?;
        Ok(())
    }
}

impl<T> Clone for WorkspaceSlot<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
            _value: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for WorkspaceSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceSlot")
            .field("namespace", &self.namespace)
            .finish()
    }
}

/// Autosaved state of the memo editor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoDraft {
    /// Memo title.
    pub title: String,
    /// Plain text.
    pub text: String,
    /// Rich-text document, when the editor produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_json: Option<Value>,
    /// Memo being edited; `None` for a new memo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    /// Version the edit started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<VersionMarker>,
    /// When the draft was saved, unix milliseconds.
    pub saved_at: u64,
}

impl MemoDraft {
    /// Returns true if the draft holds nothing worth restoring.
    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty() && self.text.trim().is_empty() && self.content_json.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pecal_storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn drafts_are_scoped_by_workspace() {
        let store = Arc::new(MemoryStore::new());
        let drafts: WorkspaceSlot<MemoDraft> =
            WorkspaceSlot::new(store.clone(), "pecal_mobile_memo_draft");

        let draft = MemoDraft {
            title: "Groceries".into(),
            text: "milk".into(),
            base_version: Some(VersionMarker(3)),
            saved_at: 1_700_000_000_000,
            ..MemoDraft::default()
        };
        drafts.save(4, &draft).await.unwrap();

        assert_eq!(drafts.load(4).await.unwrap(), Some(draft));
        assert_eq!(drafts.load(5).await.unwrap(), None);
        assert!(store.keys().contains(&"pecal_mobile_memo_draft:4".to_string()));

        drafts.clear(4).await.unwrap();
        assert_eq!(drafts.load(4).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreadable_slot_is_absent() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("pecal_mobile_memo_meta:1", "{".to_string())
            .await
            .unwrap();
        let meta: WorkspaceSlot<Value> = WorkspaceSlot::new(store, "pecal_mobile_memo_meta");
        assert_eq!(meta.load(1).await.unwrap(), None);

        meta.save(1, &json!({ "pinned": [1, 2] })).await.unwrap();
        assert_eq!(meta.load(1).await.unwrap(), Some(json!({ "pinned": [1, 2] })));
    }

    #[test]
    fn blank_draft() {
        assert!(MemoDraft::default().is_blank());
        let draft = MemoDraft {
            text: "x".into(),
            ..MemoDraft::default()
        };
        assert!(!draft.is_blank());
    }
}
