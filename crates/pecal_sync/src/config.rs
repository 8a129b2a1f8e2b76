//! Configuration for the sync core.

use crate::queue::MutationKind;
use crate::transport::Method;
use rand::Rng;
use std::time::Duration;

/// Default API server.
pub const DEFAULT_BASE_URL: &str = "https://pecal.site";

/// Environment variable overriding the API server.
pub const ENV_BASE_URL: &str = "PECAL_API_BASE_URL";

/// Environment variable overriding the per-request timeout, in seconds.
pub const ENV_REQUEST_TIMEOUT: &str = "PECAL_REQUEST_TIMEOUT_SECS";

/// Configuration for the sync client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server URL, without a trailing slash.
    pub base_url: String,
    /// Auth endpoints.
    pub endpoints: Endpoints,
    /// Where each offline mutation kind is replayed.
    pub routes: MutationRoutes,
    /// Keys used in the key-value store.
    pub storage_keys: StorageKeys,
    /// Backoff between retry attempts.
    pub retry: RetryConfig,
    /// Offline queue behavior.
    pub queue: QueueConfig,
    /// Per-request timeout enforced by the transport.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Creates a new configuration for the given server.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            endpoints: Endpoints::default(),
            routes: MutationRoutes::default(),
            storage_keys: StorageKeys::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Builds a configuration from `PECAL_API_BASE_URL` and
    /// `PECAL_REQUEST_TIMEOUT_SECS`, falling back to defaults.
    pub fn from_env() -> Self {
        let base_url = std::env::var(ENV_BASE_URL)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut config = Self::new(base_url);
        if let Some(secs) = std::env::var(ENV_REQUEST_TIMEOUT)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Sets the auth endpoints.
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Sets the mutation routes.
    pub fn with_routes(mut self, routes: MutationRoutes) -> Self {
        self.routes = routes;
        self
    }

    /// Sets the storage keys.
    pub fn with_storage_keys(mut self, keys: StorageKeys) -> Self {
        self.storage_keys = keys;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the offline queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

/// Paths of the auth endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Identity check (`GET`).
    pub identity: String,
    /// Token refresh (`POST {refresh_token}`).
    pub refresh: String,
    /// Login start; `{provider}` is substituted.
    pub login_start: String,
    /// Deep link the provider redirects to when sign-in completes.
    pub login_callback: String,
}

impl Endpoints {
    /// Login start path for a provider.
    pub fn login_start_for(&self, provider: &str) -> String {
        self.login_start.replace("{provider}", provider)
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            identity: "/api/auth/external/me".into(),
            refresh: "/api/auth/external/refresh".into(),
            login_start: "/api/auth/{provider}/start".into(),
            login_callback: "pecal://auth/callback".into(),
        }
    }
}

/// Keys used in the key-value store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    /// Serialized session.
    pub session: String,
    /// Serialized offline queue.
    pub queue: String,
    /// Namespace for per-workspace memo drafts.
    pub draft_namespace: String,
    /// Namespace for per-workspace memo metadata.
    pub meta_namespace: String,
}

impl StorageKeys {
    /// Key of the dead-letter list next to the queue.
    pub fn abandoned_queue(&self) -> String {
        format!("{}:abandoned", self.queue)
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self {
            session: "pecal_mobile_auth".into(),
            queue: "pecal_mobile_offline_queue_v1".into(),
            draft_namespace: "pecal_mobile_memo_draft".into(),
            meta_namespace: "pecal_mobile_memo_meta".into(),
        }
    }
}

/// How one mutation kind reaches the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRoute {
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Cache prefixes to drop after the write lands; `{workspace}` is
    /// replaced with the mutation's workspace id.
    pub invalidate: Vec<String>,
}

impl MutationRoute {
    /// Creates a route.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            invalidate: Vec::new(),
        }
    }

    /// Adds a cache prefix to invalidate after a successful write.
    pub fn invalidating(mut self, prefix: impl Into<String>) -> Self {
        self.invalidate.push(prefix.into());
        self
    }

    /// Cache prefixes for a given workspace.
    pub fn prefixes_for(&self, workspace_id: i64) -> Vec<String> {
        self.invalidate
            .iter()
            .map(|p| p.replace("{workspace}", &workspace_id.to_string()))
            .collect()
    }
}

/// Routes for every mutation kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRoutes {
    create_task: MutationRoute,
    create_memo: MutationRoute,
}

impl MutationRoutes {
    /// Replaces the route for a kind.
    pub fn with(mut self, kind: MutationKind, route: MutationRoute) -> Self {
        match kind {
            MutationKind::CreateTask => self.create_task = route,
            MutationKind::CreateMemo => self.create_memo = route,
        }
        self
    }

    /// Returns the route for a kind.
    pub fn get(&self, kind: MutationKind) -> &MutationRoute {
        match kind {
            MutationKind::CreateTask => &self.create_task,
            MutationKind::CreateMemo => &self.create_memo,
        }
    }
}

impl Default for MutationRoutes {
    fn default() -> Self {
        Self {
            create_task: MutationRoute::new(Method::Post, "/api/tasks")
                .invalidating("tasks:{workspace}"),
            create_memo: MutationRoute::new(Method::Post, "/api/memos").invalidating("memos:"),
        }
    }
}

/// Offline queue behavior.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    /// Move items whose replay failed permanently (4xx validation) to the
    /// dead-letter list instead of retaining them.
    pub abandon_permanent: bool,
}

impl QueueConfig {
    /// Enables the dead-letter list for permanent failures.
    pub fn abandoning_permanent_failures() -> Self {
        Self {
            abandon_permanent: true,
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that retries immediately.
    pub fn no_delay() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before a given attempt (0 is the first call).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("https://api.example.com/")
            .with_request_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::no_delay());

        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.delay_for_attempt(3), Duration::ZERO);
        assert_eq!(config.storage_keys.session, "pecal_mobile_auth");
    }

    #[test]
    fn login_start_substitutes_provider() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.login_start_for("kakao"), "/api/auth/kakao/start");
    }

    #[test]
    fn default_routes_cover_queue_kinds() {
        let routes = MutationRoutes::default();
        let task = routes.get(MutationKind::CreateTask);
        assert_eq!(task.method, Method::Post);
        assert_eq!(task.prefixes_for(7), vec!["tasks:7".to_string()]);
        assert_eq!(routes.get(MutationKind::CreateMemo).path, "/api/memos");

        let routes = routes.with(
            MutationKind::CreateMemo,
            MutationRoute::new(Method::Put, "/v2/memos"),
        );
        assert_eq!(routes.get(MutationKind::CreateMemo).method, Method::Put);
        assert!(routes.get(MutationKind::CreateMemo).invalidate.is_empty());
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(Duration::from_millis(100)).with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(126));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
