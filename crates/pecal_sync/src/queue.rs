//! Offline mutation queue.
//!
//! Writes made while the device is offline are appended to a durable FIFO
//! list and replayed later by [`OfflineQueue::flush`]. An item leaves the
//! queue only after its replay succeeded.

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use futures::future::BoxFuture;
use pecal_storage::{KeyValueStore, KeyValueStoreExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Kind of a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    /// Create a task.
    CreateTask,
    /// Create a memo.
    CreateMemo,
}

impl MutationKind {
    /// Every kind.
    pub const ALL: [MutationKind; 2] = [MutationKind::CreateTask, MutationKind::CreateMemo];

    /// Persisted name.
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::CreateTask => "create_task",
            MutationKind::CreateMemo => "create_memo",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write to perform against the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// What to do.
    pub kind: MutationKind,
    /// Workspace the write belongs to.
    pub workspace_id: i64,
    /// Request body.
    pub payload: Value,
}

impl Mutation {
    /// Creates a mutation.
    pub fn new(kind: MutationKind, workspace_id: i64, payload: Value) -> Self {
        Self {
            kind,
            workspace_id,
            payload,
        }
    }

    /// A task creation.
    pub fn create_task(workspace_id: i64, payload: Value) -> Self {
        Self::new(MutationKind::CreateTask, workspace_id, payload)
    }

    /// A memo creation.
    pub fn create_memo(workspace_id: i64, payload: Value) -> Self {
        Self::new(MutationKind::CreateMemo, workspace_id, payload)
    }
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique id, stable across restarts.
    pub id: Uuid,
    /// What to do.
    #[serde(rename = "type")]
    pub kind: MutationKind,
    /// Workspace the write belongs to.
    pub workspace_id: i64,
    /// Request body.
    pub payload: Value,
    /// Enqueue time, unix milliseconds.
    pub created_at: u64,
    /// Failed replays so far.
    pub retry_count: u32,
}

impl QueueItem {
    fn new(mutation: Mutation) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: mutation.kind,
            workspace_id: mutation.workspace_id,
            payload: mutation.payload,
            created_at: now_millis(),
            retry_count: 0,
        }
    }

    /// The write this item replays.
    pub fn mutation(&self) -> Mutation {
        Mutation::new(self.kind, self.workspace_id, self.payload.clone())
    }
}

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Items replayed successfully and removed.
    pub processed: usize,
    /// Items whose replay failed and were kept.
    pub failed: usize,
    /// Items left in the queue.
    pub remaining: usize,
    /// Items moved to the dead-letter list.
    pub abandoned: usize,
}

type Handler = Arc<dyn Fn(QueueItem) -> BoxFuture<'static, SyncResult<()>> + Send + Sync>;

/// Replay handlers, one per mutation kind.
#[derive(Clone, Default)]
pub struct QueueHandlers {
    handlers: HashMap<MutationKind, Handler>,
}

impl QueueHandlers {
    /// Creates an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `kind`.
    pub fn on<F, Fut>(mut self, kind: MutationKind, handler: F) -> Self
    where
        F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        self.handlers.insert(
            kind,
            Arc::new(move |item: QueueItem| -> BoxFuture<'static, SyncResult<()>> {
                Box::pin(handler(item))
            }),
        );
        self
    }

    fn get(&self, kind: MutationKind) -> Option<&Handler> {
        self.handlers.get(&kind)
    }
}

impl fmt::Debug for QueueHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// Durable FIFO of offline writes.
pub struct OfflineQueue {
    store: Arc<dyn KeyValueStore>,
    key: String,
    abandoned_key: String,
    config: QueueConfig,
    write_lock: Mutex<()>,
    flushing: AtomicBool,
}

impl OfflineQueue {
    /// Creates a queue persisted under `key`, with its dead-letter list
    /// under `abandoned_key`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        abandoned_key: impl Into<String>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            abandoned_key: abandoned_key.into(),
            config,
            write_lock: Mutex::new(()),
            flushing: AtomicBool::new(false),
        }
    }

    /// Appends a mutation. Never touches the network.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub async fn enqueue(&self, mutation: Mutation) -> SyncResult<QueueItem> {
        let item = QueueItem::new(mutation);
        let _guard = self.write_lock.lock().await;
        let mut items = self.read_list(&self.key).await?;
        items.push(item.clone());
        self.store.set_json(&self.key, &items).await?;
        debug!(id = %item.id, kind = %item.kind, queued = items.len(), "mutation queued");
        Ok(item)
    }

    /// Number of queued items.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub async fn count(&self) -> SyncResult<usize> {
        Ok(self.read_list(&self.key).await?.len())
    }

    /// Queued items, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read.
    pub async fn items(&self) -> SyncResult<Vec<QueueItem>> {
        self.read_list(&self.key).await
    }

    /// Drops every queued item.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be written.
    pub async fn clear(&self) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(&self.key).await?;
        Ok(())
    }

    /// Items moved aside after a permanent failure.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be read.
    pub async fn abandoned(&self) -> SyncResult<Vec<QueueItem>> {
        self.read_list(&self.abandoned_key).await
    }

    /// Empties the dead-letter list.
    ///
    /// # Errors
    ///
    /// Returns an error if the list cannot be written.
    pub async fn clear_abandoned(&self) -> SyncResult<()> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(&self.abandoned_key).await?;
        Ok(())
    }

    /// Replays every queued item in order.
    ///
    /// Successful items are removed. Failed items stay with their retry
    /// count incremented, or move to the dead-letter list when
    /// [`QueueConfig::abandon_permanent`] is set and the failure is
    /// permanent. The list is rewritten once at the end of the pass. A flush
    /// started while another one runs does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or written. Handler
    /// failures are reported in the [`FlushReport`].
    pub async fn flush(&self, handlers: &QueueHandlers) -> SyncResult<FlushReport> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("flush already running");
            return Ok(FlushReport {
                remaining: self.count().await?,
                ..FlushReport::default()
            });
        }
        let _flushing = FlushingFlag(&self.flushing);

        let snapshot = {
            let _guard = self.write_lock.lock().await;
            self.read_list(&self.key).await?
        };
        if snapshot.is_empty() {
            return Ok(FlushReport::default());
        }
        debug!(items = snapshot.len(), "flushing offline queue");

        let mut report = FlushReport::default();
        let mut retained = Vec::new();
        let mut abandoned = Vec::new();
        let seen: HashSet<Uuid> = snapshot.iter().map(|item| item.id).collect();

        for item in snapshot {
            let outcome = match handlers.get(item.kind) {
                Some(handler) => (**handler)(item.clone()).await,
                None => {
                    warn!(kind = %item.kind, "no handler for queued mutation");
                    Err(SyncError::Decode(format!("no handler for {}", item.kind)))
                }
            };
            match outcome {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    debug!(id = %item.id, error = %err, "replay failed");
                    let failed = QueueItem {
                        retry_count: item.retry_count.saturating_add(1),
                        ..item
                    };
                    if self.config.abandon_permanent && err.is_permanent() {
                        report.abandoned += 1;
                        abandoned.push(failed);
                    } else {
                        report.failed += 1;
                        retained.push(failed);
                    }
                }
            }
        }

        let _guard = self.write_lock.lock().await;
        if !abandoned.is_empty() {
            let mut dead = self.read_list(&self.abandoned_key).await?;
            dead.extend(abandoned);
            self.store.set_json(&self.abandoned_key, &dead).await?;
        }
        // Keep whatever was enqueued while the handlers ran.
        let current = self.read_list(&self.key).await?;
        retained.extend(current.into_iter().filter(|item| !seen.contains(&item.id)));
        self.store.set_json(&self.key, &retained).await?;

        report.remaining = retained.len();
        debug!(
            processed = report.processed,
            failed = report.failed,
            abandoned = report.abandoned,
            remaining = report.remaining,
            "flush finished"
        );
        Ok(report)
    }

    async fn read_list(&self, key: &str) -> SyncResult<Vec<QueueItem>> {
        match self.store.get_json::<Vec<QueueItem>>(key).await {
            Ok(items) => Ok(items.unwrap_or_default()),
            Err(err) if err.is_corruption() => {
                warn!(key, error = %err, "treating unreadable queue as empty");
                Ok(Vec::new())
            }
            Err(err) => Err(SyncError::from(err)),
        }
    }
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("key", &self.key)
            .field("flushing", &self.flushing.load(Ordering::SeqCst))
            .finish()
    }
}

struct FlushingFlag<'a>(&'a AtomicBool);

impl Drop for FlushingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pecal_storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    const KEY: &str = "pecal_mobile_offline_queue_v1";

    fn queue_with(store: Arc<MemoryStore>, config: QueueConfig) -> OfflineQueue {
        OfflineQueue::new(store, KEY, format!("{KEY}:abandoned"), config)
    }

    fn recording(log: &Arc<parking_lot::Mutex<Vec<String>>>, fail_on: &'static str) -> QueueHandlers {
        let task_log = Arc::clone(log);
        let memo_log = Arc::clone(log);
        QueueHandlers::new()
            .on(MutationKind::CreateTask, move |item| {
                let log = Arc::clone(&task_log);
                async move {
                    let title = item.payload["title"].as_str().unwrap_or_default().to_string();
                    log.lock().push(title.clone());
                    if title == fail_on {
                        Err(SyncError::network("offline"))
                    } else {
                        Ok(())
                    }
                }
            })
            .on(MutationKind::CreateMemo, move |item| {
                let log = Arc::clone(&memo_log);
                async move {
                    log.lock().push(format!("memo:{}", item.payload["title"]));
                    Ok(())
                }
            })
    }

    #[test]
    fn persisted_shape() {
        let item = QueueItem::new(Mutation::create_task(3, json!({ "title": "a" })));
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], "create_task");
        assert_eq!(value["workspaceId"], 3);
        assert_eq!(value["retryCount"], 0);
        assert!(value["createdAt"].as_u64().unwrap() > 0);
        assert!(value.get("kind").is_none());
    }

    #[tokio::test]
    async fn enqueue_is_durable_and_ordered() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), QueueConfig::default());
        for title in ["A", "B", "C"] {
            queue
                .enqueue(Mutation::create_task(1, json!({ "title": title })))
                .await
                .unwrap();
        }

        let reopened = queue_with(store, QueueConfig::default());
        let titles: Vec<_> = reopened
            .items()
            .await
            .unwrap()
            .iter()
            .map(|item| item.payload["title"].clone())
            .collect();
        assert_eq!(titles, vec![json!("A"), json!("B"), json!("C")]);
        assert_eq!(reopened.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn flush_keeps_failures_in_order() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), QueueConfig::default());
        for title in ["A", "B", "C"] {
            queue
                .enqueue(Mutation::create_task(1, json!({ "title": title })))
                .await
                .unwrap();
        }

        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let report = queue.flush(&recording(&log, "B")).await.unwrap();
        assert_eq!(
            report,
            FlushReport {
                processed: 2,
                failed: 1,
                remaining: 1,
                abandoned: 0
            }
        );
        assert_eq!(*log.lock(), vec!["A", "B", "C"]);

        let left = queue.items().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].payload["title"], "B");
        assert_eq!(left[0].retry_count, 1);
    }

    #[tokio::test]
    async fn flush_empty_queue_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store.clone(), QueueConfig::default());
        let report = queue.flush(&QueueHandlers::new()).await.unwrap();
        assert_eq!(report, FlushReport::default());
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn missing_handler_counts_as_failure() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store, QueueConfig::default());
        queue
            .enqueue(Mutation::create_memo(1, json!({ "title": "m" })))
            .await
            .unwrap();

        let report = queue.flush(&QueueHandlers::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);
    }

    #[tokio::test]
    async fn permanent_failures_can_be_abandoned() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(store, QueueConfig::abandoning_permanent_failures());
        queue
            .enqueue(Mutation::create_task(1, json!({ "title": "" })))
            .await
            .unwrap();
        queue
            .enqueue(Mutation::create_task(1, json!({ "title": "later" })))
            .await
            .unwrap();

        let handlers = QueueHandlers::new().on(MutationKind::CreateTask, |item: QueueItem| async move {
            if item.payload["title"] == "" {
                Err(SyncError::from_status(422, json!({ "error": "title is required" })))
            } else {
                Err(SyncError::network("offline"))
            }
        });
        let report = queue.flush(&handlers).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 1);

        let dead = queue.abandoned().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 1);

        queue.clear_abandoned().await.unwrap();
        assert!(queue.abandoned().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_queue_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(KEY, "[{oops".to_string()).await.unwrap();
        let queue = queue_with(store, QueueConfig::default());

        assert_eq!(queue.count().await.unwrap(), 0);
        queue
            .enqueue(Mutation::create_task(1, json!({})))
            .await
            .unwrap();
        assert_eq!(queue.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn items_enqueued_during_flush_are_kept() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(queue_with(store, QueueConfig::default()));
        queue
            .enqueue(Mutation::create_task(1, json!({ "title": "first" })))
            .await
            .unwrap();

        let inner = Arc::clone(&queue);
        let handlers = QueueHandlers::new().on(MutationKind::CreateTask, move |item: QueueItem| {
            let queue = Arc::clone(&inner);
            async move {
                if item.payload["title"] == "first" {
                    queue
                        .enqueue(Mutation::create_task(1, json!({ "title": "second" })))
                        .await?;
                }
                Err(SyncError::network("offline"))
            }
        });

        let report = queue.flush(&handlers).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.remaining, 2);
        let titles: Vec<_> = queue
            .items()
            .await
            .unwrap()
            .into_iter()
            .map(|item| (item.payload["title"].clone(), item.retry_count))
            .collect();
        assert_eq!(
            titles,
            vec![(json!("first"), 1), (json!("second"), 0)]
        );
    }

    #[tokio::test]
    async fn concurrent_flush_is_a_noop() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(queue_with(store, QueueConfig::default()));
        queue
            .enqueue(Mutation::create_task(1, json!({ "title": "a" })))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let handlers = {
            let calls = Arc::clone(&calls);
            QueueHandlers::new().on(MutationKind::CreateTask, move |_item: QueueItem| {
                let calls = Arc::clone(&calls);
                let release_rx = Arc::clone(&release_rx);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok(())
                }
            })
        };

        let first = {
            let queue = Arc::clone(&queue);
            let handlers = handlers.clone();
            tokio::spawn(async move { queue.flush(&handlers).await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = queue.flush(&handlers).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.remaining, 1);

        release_tx.send(()).unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.count().await.unwrap(), 0);
    }
}
