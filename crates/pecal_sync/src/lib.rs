//! # Pecal Sync
//!
//! Client-side synchronization core for Pecal.
//!
//! This crate provides:
//! - Authenticated requests with single-flight token refresh
//! - Read-through caching with per-key dedupe and retry
//! - A durable offline queue for writes made without a network
//! - Optimistic-concurrency checks for record editors
//! - Per-workspace draft slots
//!
//! ## Architecture
//!
//! [`SyncClient`] is the one service object an application holds. It owns a
//! [`SessionManager`], a [`RequestCoordinator`] and an [`OfflineQueue`], and
//! talks to the server through an [`HttpTransport`]. Durable state lives in
//! a [`pecal_storage::KeyValueStore`].
//!
//! ```text
//! screen ──► SyncClient::fetch ──► RequestCoordinator ──► SyncClient::request
//!                                                              │
//!                                   SessionManager ◄── 401 ────┤
//!                                                              ▼
//!                                                        HttpTransport
//! ```
//!
//! ## Key Invariants
//!
//! - At most one token refresh is in flight at a time
//! - Concurrent reads of one key share one transport call
//! - Queued writes replay in enqueue order and leave only on success
//! - A newer server version is never overwritten without `force`
//! - Tokens never appear in logs
//!
//! ## Example
//!
//! ```rust
//! use pecal_storage::MemoryStore;
//! use pecal_sync::{HttpRequest, Method, MockTransport, RunOptions, SyncClient};
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let transport = Arc::new(MockTransport::new());
//! transport.respond_always(Method::Get, "/api/tasks", 200, json!([]));
//!
//! let client = SyncClient::builder(transport.clone(), Arc::new(MemoryStore::new())).build();
//! let options = RunOptions::cached(Duration::from_secs(30));
//! client.fetch("tasks:1", HttpRequest::get("/api/tasks"), options).await.unwrap();
//! client.fetch("tasks:1", HttpRequest::get("/api/tasks"), options).await.unwrap();
//! assert_eq!(transport.calls(Method::Get, "/api/tasks"), 1);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod coordinator;
mod drafts;
mod error;
mod flight;
mod guard;
mod http;
mod queue;
mod session;
mod transport;

pub use client::{SyncClient, SyncClientBuilder, WriteOutcome};
pub use config::{
    ClientConfig, Endpoints, MutationRoute, MutationRoutes, QueueConfig, RetryConfig,
    StorageKeys, DEFAULT_BASE_URL, ENV_BASE_URL, ENV_REQUEST_TIMEOUT,
};
pub use coordinator::{CacheEntry, RequestCoordinator, RunOptions};
pub use drafts::{MemoDraft, WorkspaceSlot};
pub use error::{is_retryable_status, AuthFailureReason, SyncError, SyncResult};
pub use flight::SingleFlight;
pub use guard::{
    ConcurrencyGuard, EditorSession, HttpRecordSource, Record, RecordSource, SaveOutcome,
    VersionMarker,
};
pub use http::ReqwestTransport;
pub use queue::{FlushReport, Mutation, MutationKind, OfflineQueue, QueueHandlers, QueueItem};
pub use session::{AuthProvider, AuthorizationOutcome, Authorizer, Session, SessionManager};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, MockTransport};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
