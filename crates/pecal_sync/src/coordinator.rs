//! Request coordination: read-through cache, single-flight dedupe and retry.

use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::flight::SingleFlight;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Per-call options for [`RequestCoordinator::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// How long a successful result stays fresh. Zero disables caching.
    pub ttl: Duration,
    /// Join an identical call that is already running.
    pub dedupe: bool,
    /// Additional attempts after a retryable failure.
    pub retries: u32,
}

impl RunOptions {
    /// Options caching the result for `ttl`.
    pub fn cached(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    /// Sets the cache lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the number of retries.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Neither joins nor registers an in-flight call.
    pub fn without_dedupe(mut self) -> Self {
        self.dedupe = false;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
            dedupe: true,
            retries: 1,
        }
    }
}

/// A cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stored value.
    pub value: Value,
    /// When the value was stored.
    pub stored_at: Instant,
    /// How long the value stays fresh.
    pub ttl: Duration,
}

impl CacheEntry {
    /// Returns true while the entry is younger than its ttl.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

type Cache = Arc<RwLock<HashMap<String, CacheEntry>>>;

/// Deduplicates, caches and retries keyed reads.
///
/// All state lives behind one coordinator; share it by reference or through
/// the owning [`SyncClient`](crate::SyncClient).
#[derive(Debug)]
pub struct RequestCoordinator {
    cache: Cache,
    flights: SingleFlight<String, SyncResult<Value>>,
    retry: RetryConfig,
}

impl RequestCoordinator {
    /// Creates a coordinator with the given backoff policy.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            flights: SingleFlight::new(),
            retry,
        }
    }

    /// Runs `operation` for `key`.
    ///
    /// A running call for the same key is joined (when `dedupe` is set),
    /// otherwise a fresh cached value is returned without calling
    /// `operation`, otherwise `operation` runs on its own task with retries
    /// and a success is cached for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns the operation's last error once retries are exhausted, or
    /// immediately for a non-retryable error.
    pub async fn run<F, Fut>(&self, key: &str, operation: F, options: RunOptions) -> SyncResult<Value>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        let joining = options.dedupe && self.flights.contains(&key.to_string());
        if !joining {
            if let Some(value) = self.peek(key) {
                debug!(key, "cache hit");
                return Ok(value);
            }
        } else {
            debug!(key, "joining in-flight call");
        }

        let cache = Arc::clone(&self.cache);
        let retry = self.retry.clone();
        let owned_key = key.to_string();
        let work = move || async move {
            // Another flight may have landed between the lookup and now.
            if let Some(value) = fresh_value(&cache, &owned_key) {
                return Ok(value);
            }
            let result = with_retries(&operation, options.retries, &retry, &owned_key).await;
            if let Ok(value) = &result {
                if !options.ttl.is_zero() {
                    cache.write().insert(
                        owned_key,
                        CacheEntry {
                            value: value.clone(),
                            stored_at: Instant::now(),
                            ttl: options.ttl,
                        },
                    );
                }
            }
            result
        };

        if options.dedupe {
            self.flights.run(key.to_string(), work).await?
        } else {
            tokio::spawn(work())
                .await
                .map_err(|_| SyncError::Aborted)?
        }
    }

    /// Like [`run`](Self::run), deserializing the value into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Decode`] if the value does not match `T`.
    pub async fn run_as<T, F, Fut>(&self, key: &str, operation: F, options: RunOptions) -> SyncResult<T>
    where
        T: DeserializeOwned,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Value>> + Send + 'static,
    {
        let value = self.run(key, operation, options).await?;
        serde_json::from_value(value).map_err(|e| SyncError::Decode(e.to_string()))
    }

    /// Returns the cached value for `key` if it is still fresh. Expired
    /// entries are dropped.
    pub fn peek(&self, key: &str) -> Option<Value> {
        fresh_value(&self.cache, key)
    }

    /// Drops every cached entry whose key starts with `prefix`, or all
    /// entries for `None`. Returns the number dropped.
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        match prefix {
            Some(prefix) => cache.retain(|key, _| !key.starts_with(prefix)),
            None => cache.clear(),
        }
        let dropped = before - cache.len();
        debug!(prefix = prefix.unwrap_or("*"), dropped, "cache invalidated");
        dropped
    }

    /// Number of fresh cached entries.
    pub fn cached_len(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write();
        cache.retain(|_, entry| entry.is_fresh(now));
        cache.len()
    }

    /// Number of calls currently running.
    pub fn in_flight_len(&self) -> usize {
        self.flights.len()
    }

    /// Callers attached to the running call for `key`.
    pub fn subscribers(&self, key: &str) -> usize {
        self.flights.subscribers(&key.to_string())
    }
}

impl Default for RequestCoordinator {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

fn fresh_value(cache: &Cache, key: &str) -> Option<Value> {
    let now = Instant::now();
    {
        let cache = cache.read();
        match cache.get(key) {
            Some(entry) if entry.is_fresh(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
    }
    let mut cache = cache.write();
    if cache.get(key).is_some_and(|entry| !entry.is_fresh(now)) {
        cache.remove(key);
    }
    None
}

async fn with_retries<F, Fut>(
    operation: &F,
    retries: u32,
    retry: &RetryConfig,
    key: &str,
) -> SyncResult<Value>
where
    F: Fn() -> Fut,
    Fut: Future<Output = SyncResult<Value>>,
{
    let mut attempt = 0;
    loop {
        let delay = retry.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < retries => {
                attempt += 1;
                debug!(key, attempt, error = %err, "retrying");
            }
            Err(err) => return Err(err),
        }
    }
}
