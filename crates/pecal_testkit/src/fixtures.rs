//! Test fixtures: a wired-up client over the fake backend.

use crate::fake_api::FakeApi;
use async_trait::async_trait;
use parking_lot::Mutex;
use pecal_storage::{FileStore, KeyValueStore, KeyValueStoreExt, MemoryStore};
use pecal_sync::{
    AuthorizationOutcome, Authorizer, ClientConfig, RetryConfig, Session, SyncClient,
};
use std::sync::Arc;
use tempfile::TempDir;

/// A client, its store and the fake backend it talks to.
pub struct TestHarness {
    /// The simulated backend.
    pub api: Arc<FakeApi>,
    /// Durable state.
    pub store: Arc<dyn KeyValueStore>,
    /// The client under test.
    pub client: SyncClient,
    config: ClientConfig,
    _temp_dir: Option<TempDir>,
}

impl TestHarness {
    /// Creates a signed-out harness over an in-memory store. Retries do not
    /// wait.
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a signed-out harness with a custom configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        Self::assemble(Arc::new(MemoryStore::new()), config, None)
    }

    /// Creates a signed-out harness over a [`FileStore`] in a temporary
    /// directory.
    pub fn on_disk() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(temp_dir.path()).expect("Failed to open file store");
        Self::assemble(Arc::new(store), test_config(), Some(temp_dir))
    }

    fn assemble(
        store: Arc<dyn KeyValueStore>,
        config: ClientConfig,
        temp_dir: Option<TempDir>,
    ) -> Self {
        let api = Arc::new(FakeApi::new());
        let client = SyncClient::builder(api.clone(), Arc::clone(&store))
            .config(config.clone())
            .build();
        Self {
            api,
            store,
            client,
            config,
            _temp_dir: temp_dir,
        }
    }

    /// Persists a fresh session for `subject_id` and restores it, as an app
    /// start after an earlier sign-in would.
    pub async fn signed_in(subject_id: u64) -> Self {
        let harness = Self::new();
        harness.sign_in(subject_id).await;
        harness
    }

    /// Issues and restores a session on this harness.
    pub async fn sign_in(&self, subject_id: u64) -> Session {
        let session = self.api.issue_session(subject_id, "Tester");
        self.store
            .set_json(&self.config.storage_keys.session, &session)
            .await
            .expect("Failed to persist session");
        self.client
            .sessions()
            .restore()
            .await
            .expect("Fresh session failed validation")
    }

    /// The session as currently persisted.
    pub async fn persisted_session(&self) -> Option<Session> {
        self.store
            .get_json(&self.config.storage_keys.session)
            .await
            .expect("Failed to read session")
    }

    /// Builds a second client over the same store and backend, as after an
    /// app restart.
    pub fn restart(&self) -> SyncClient {
        self.client.shutdown();
        SyncClient::builder(self.api.clone(), Arc::clone(&self.store))
            .config(self.config.clone())
            .build()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Default configuration for tests.
pub fn test_config() -> ClientConfig {
    ClientConfig::new("http://fake.pecal.test").with_retry(RetryConfig::no_delay())
}

/// Signs in against a [`FakeApi`] without a browser.
pub struct FakeAuthorizer {
    api: Option<Arc<FakeApi>>,
    outcome: Option<AuthorizationOutcome>,
    subject_id: u64,
    nickname: String,
    seen: Mutex<Vec<String>>,
}

impl FakeAuthorizer {
    /// Approves every sign-in as `subject_id`.
    pub fn approving(api: Arc<FakeApi>, subject_id: u64, nickname: &str) -> Self {
        Self {
            api: Some(api),
            outcome: None,
            subject_id,
            nickname: nickname.to_string(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Ends every sign-in with `outcome`.
    pub fn returning(outcome: AuthorizationOutcome) -> Self {
        Self {
            api: None,
            outcome: Some(outcome),
            subject_id: 0,
            nickname: String::new(),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Auth URLs opened so far.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn authorize(&self, auth_url: &str, callback_url: &str) -> AuthorizationOutcome {
        self.seen.lock().push(auth_url.to_string());
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let Some(api) = &self.api else {
            return AuthorizationOutcome::Dismissed;
        };

        let session = api.issue_session(self.subject_id, &self.nickname);
        let subject_id = self.subject_id.to_string();
        let url = reqwest::Url::parse_with_params(
            callback_url,
            [
                ("accessToken", session.access_token.as_str()),
                ("refreshToken", session.refresh_token.as_str()),
                ("memberId", subject_id.as_str()),
                ("nickname", self.nickname.as_str()),
                ("provider", "kakao"),
            ],
        );
        match url {
            Ok(url) => AuthorizationOutcome::Callback(url.to_string()),
            Err(_) => AuthorizationOutcome::Dismissed,
        }
    }
}
