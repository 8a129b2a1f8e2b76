//! The sync client: authenticated requests, cached reads and offline-aware
//! writes.

use crate::config::{ClientConfig, MutationRoute};
use crate::coordinator::{RequestCoordinator, RunOptions};
use crate::drafts::{MemoDraft, WorkspaceSlot};
use crate::error::{AuthFailureReason, SyncError, SyncResult};
use crate::queue::{FlushReport, Mutation, MutationKind, OfflineQueue, QueueHandlers, QueueItem};
use crate::session::{Authorizer, Session, SessionManager};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use pecal_storage::KeyValueStore;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Result of [`SyncClient::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server accepted the write.
    Applied(Value),
    /// The network was unavailable; the write waits in the offline queue.
    Queued {
        /// Queue item id.
        id: Uuid,
    },
}

impl WriteOutcome {
    /// Returns true if the write is waiting in the offline queue.
    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued { .. })
    }
}

/// Builds a [`SyncClient`].
pub struct SyncClientBuilder {
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn KeyValueStore>,
    config: ClientConfig,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl SyncClientBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the collaborator that drives provider sign-in pages.
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Builds the client. No I/O happens until the first call.
    pub fn build(self) -> SyncClient {
        let keys = &self.config.storage_keys;
        let sessions = SessionManager::new(
            Arc::clone(&self.store),
            Arc::clone(&self.transport),
            self.config.endpoints.clone(),
            keys.session.clone(),
        );
        if let Some(authorizer) = self.authorizer {
            sessions.set_authorizer(authorizer);
        }
        let queue = OfflineQueue::new(
            Arc::clone(&self.store),
            keys.queue.clone(),
            keys.abandoned_queue(),
            self.config.queue.clone(),
        );
        let coordinator = RequestCoordinator::new(self.config.retry.clone());

        SyncClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport: self.transport,
                store: self.store,
                sessions,
                coordinator,
                queue,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn HttpTransport>,
    store: Arc<dyn KeyValueStore>,
    sessions: SessionManager,
    coordinator: RequestCoordinator,
    queue: OfflineQueue,
    closed: AtomicBool,
}

/// Entry point of the sync core.
///
/// Owns the session manager, the request coordinator and the offline queue.
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Starts building a client over a transport and a store.
    pub fn builder(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn KeyValueStore>,
    ) -> SyncClientBuilder {
        SyncClientBuilder {
            transport,
            store,
            config: ClientConfig::default(),
            authorizer: None,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Returns the session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Returns the request coordinator.
    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.inner.coordinator
    }

    /// Returns the offline queue.
    pub fn queue(&self) -> &OfflineQueue {
        &self.inner.queue
    }

    /// Returns the key-value store.
    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.inner.store
    }

    /// Autosaved memo drafts, per workspace.
    pub fn memo_drafts(&self) -> WorkspaceSlot<MemoDraft> {
        WorkspaceSlot::new(
            Arc::clone(&self.inner.store),
            self.inner.config.storage_keys.draft_namespace.clone(),
        )
    }

    /// Memo metadata such as pinned flags, per workspace.
    pub fn memo_meta(&self) -> WorkspaceSlot<Value> {
        WorkspaceSlot::new(
            Arc::clone(&self.inner.store),
            self.inner.config.storage_keys.meta_namespace.clone(),
        )
    }

    /// Sends an authenticated request.
    ///
    /// A 401 with a live session triggers one refresh and one retry with the
    /// new token. If the retry is rejected too, the session was replaced by
    /// a sign-in elsewhere.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Unauthorized`] for a 401 without a session
    /// - [`SyncError::RefreshExpired`] if the refresh failed
    /// - [`SyncError::SessionConflict`] if the refreshed token was rejected
    ///
    /// The three end the session. Other failures keep their kind.
    pub async fn request(&self, request: HttpRequest) -> SyncResult<Value> {
        self.ensure_open()?;
        let sessions = &self.inner.sessions;

        let session = sessions.active_session();
        let first = self.send(&request, session.as_ref()).await?;
        if first.status != 401 {
            return first.into_result();
        }

        let Some(session) = session else {
            sessions
                .classify_failure(AuthFailureReason::Unauthorized)
                .await;
            return Err(SyncError::Unauthorized);
        };
        let Some(refreshed) = sessions.refresh(&session).await else {
            sessions
                .classify_failure(AuthFailureReason::RefreshExpired)
                .await;
            return Err(SyncError::RefreshExpired);
        };

        let retried = self.send(&request, Some(&refreshed)).await?;
        if retried.status == 401 {
            sessions
                .classify_failure(AuthFailureReason::SessionConflict)
                .await;
            return Err(SyncError::SessionConflict);
        }
        retried.into_result()
    }

    /// Reads through the request coordinator: cached for `options.ttl`,
    /// deduplicated per `key` and retried.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn fetch(
        &self,
        key: &str,
        request: HttpRequest,
        options: RunOptions,
    ) -> SyncResult<Value> {
        let client = self.clone();
        self.inner
            .coordinator
            .run(
                key,
                move || {
                    let client = client.clone();
                    let request = request.clone();
                    async move { client.request(request).await }
                },
                options,
            )
            .await
    }

    /// Like [`fetch`](Self::fetch), deserializing the value into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decode`] if the value does not match `T`.
    pub async fn fetch_as<T: DeserializeOwned>(
        &self,
        key: &str,
        request: HttpRequest,
        options: RunOptions,
    ) -> SyncResult<T> {
        let value = self.fetch(key, request, options).await?;
        serde_json::from_value(value).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// Performs a write, queueing it if the network is unavailable.
    ///
    /// # Errors
    ///
    /// Returns every failure other than [`SyncError::NetworkUnavailable`].
    pub async fn submit(&self, mutation: Mutation) -> SyncResult<WriteOutcome> {
        let route = self.inner.config.routes.get(mutation.kind).clone();
        match self.request(route_request(&route, &mutation.payload)).await {
            Ok(value) => {
                self.invalidate_route(&route, mutation.workspace_id);
                Ok(WriteOutcome::Applied(value))
            }
            Err(SyncError::NetworkUnavailable { message }) => {
                debug!(kind = %mutation.kind, %message, "offline, queueing write");
                let item = self.inner.queue.enqueue(mutation).await?;
                Ok(WriteOutcome::Queued { id: item.id })
            }
            Err(err) => Err(err),
        }
    }

    /// Replays the offline queue through [`request`](Self::request).
    ///
    /// Does nothing without a session. Cache entries of every workspace
    /// touched by the pass are dropped if anything was replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or written.
    pub async fn flush_queue(&self) -> SyncResult<FlushReport> {
        self.ensure_open()?;
        let queue = &self.inner.queue;
        if self.inner.sessions.active_session().is_none() {
            debug!("no session, leaving offline queue untouched");
            return Ok(FlushReport {
                remaining: queue.count().await?,
                ..FlushReport::default()
            });
        }

        let touched: HashSet<(MutationKind, i64)> = queue
            .items()
            .await?
            .iter()
            .map(|item| (item.kind, item.workspace_id))
            .collect();

        let report = queue.flush(&self.replay_handlers()).await?;
        if report.processed > 0 {
            for (kind, workspace_id) in touched {
                self.invalidate_route(self.inner.config.routes.get(kind), workspace_id);
            }
        }
        Ok(report)
    }

    /// Drops cached reads whose key starts with `prefix`, or all of them.
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        self.inner.coordinator.invalidate(prefix)
    }

    /// The live session, if any.
    pub fn active_session(&self) -> Option<Session> {
        self.inner.sessions.active_session()
    }

    /// Stops accepting calls and drops cached reads. Queued writes stay
    /// persisted for the next client.
    pub fn shutdown(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.coordinator.invalidate(None);
            info!("sync client shut down");
        }
    }

    /// Returns true after [`shutdown`](Self::shutdown).
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.is_shut_down() {
            Err(SyncError::Aborted)
        } else {
            Ok(())
        }
    }

    async fn send(
        &self,
        request: &HttpRequest,
        session: Option<&Session>,
    ) -> SyncResult<HttpResponse> {
        let mut request = request
            .clone()
            .with_header("Content-Type", "application/json");
        if let Some(session) = session {
            request = request.with_bearer(&session.access_token);
        }
        self.inner.transport.send(&request).await
    }

    fn replay_handlers(&self) -> QueueHandlers {
        MutationKind::ALL
            .into_iter()
            .fold(QueueHandlers::new(), |handlers, kind| {
                let client = self.clone();
                let route = self.inner.config.routes.get(kind).clone();
                handlers.on(kind, move |item: QueueItem| {
                    let client = client.clone();
                    let request = route_request(&route, &item.payload);
                    async move { client.request(request).await.map(|_| ()) }
                })
            })
    }

    fn invalidate_route(&self, route: &MutationRoute, workspace_id: i64) {
        for prefix in route.prefixes_for(workspace_id) {
            self.inner.coordinator.invalidate(Some(&prefix));
        }
    }
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("base_url", &self.inner.config.base_url)
            .field("sessions", &self.inner.sessions)
            .field("coordinator", &self.inner.coordinator)
            .field("queue", &self.inner.queue)
            .finish()
    }
}

fn route_request(route: &MutationRoute, payload: &Value) -> HttpRequest {
    HttpRequest::new(route.method, route.path.clone()).with_json(payload.clone())
}
