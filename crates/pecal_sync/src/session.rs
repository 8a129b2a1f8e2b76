//! Session management.
//!
//! The [`SessionManager`] owns the one live [`Session`] of the process. It
//! restores and validates the persisted session at startup, refreshes the
//! access token with at most one refresh call in flight, and forces a logout
//! when a failure cannot be repaired.

use crate::config::Endpoints;
use crate::error::{AuthFailureReason, SyncError, SyncResult};
use crate::flight::SingleFlight;
use crate::transport::{HttpRequest, HttpTransport};
use async_trait::async_trait;
use pecal_storage::{KeyValueStore, KeyValueStoreExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Identity provider used to sign in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProvider {
    /// Kakao
    Kakao,
    /// Google
    Google,
    /// Apple
    Apple,
}

impl AuthProvider {
    /// Lower-case provider name used in URLs.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthProvider::Kakao => "kakao",
            AuthProvider::Google => "google",
            AuthProvider::Apple => "apple",
        }
    }
}

impl fmt::Display for AuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthProvider {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kakao" => Ok(AuthProvider::Kakao),
            "google" => Ok(AuthProvider::Google),
            "apple" => Ok(AuthProvider::Apple),
            other => Err(SyncError::LoginFailed(format!("unknown provider: {other}"))),
        }
    }
}

/// An authenticated session.
///
/// Sessions are immutable values: a refresh or login produces a new one.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Short-lived bearer token.
    pub access_token: String,
    /// Token exchanged for a new pair on refresh.
    pub refresh_token: String,
    /// Account id.
    pub subject_id: u64,
    /// Name shown in the UI.
    pub display_name: String,
    /// Provider the account signed in with.
    pub auth_provider: AuthProvider,
    /// Account email, when the provider shares it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Session {
    /// Returns a copy carrying a new token pair.
    pub fn with_tokens(&self, access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("subject_id", &self.subject_id)
            .field("display_name", &self.display_name)
            .field("auth_provider", &self.auth_provider)
            .field("email", &self.email)
            .finish()
    }
}

/// How an external sign-in flow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// The provider redirected to the callback URL.
    Callback(String),
    /// The user cancelled.
    Cancelled,
    /// The sign-in screen was closed.
    Dismissed,
}

/// Drives the provider's sign-in page, e.g. in a browser.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Opens `auth_url` and waits until the provider redirects to
    /// `callback_url` or the user gives up.
    async fn authorize(&self, auth_url: &str, callback_url: &str) -> AuthorizationOutcome;
}

struct Inner {
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn HttpTransport>,
    endpoints: Endpoints,
    storage_key: String,
    current: RwLock<Option<Session>>,
    // Held across every change of the live session and its persisted copy.
    writer: tokio::sync::Mutex<()>,
    refreshes: SingleFlight<(), Option<Session>>,
    authorizer: RwLock<Option<Arc<dyn Authorizer>>>,
    last_failure: Mutex<Option<AuthFailureReason>>,
    failures: broadcast::Sender<AuthFailureReason>,
}

/// Owns the live session. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates a manager persisting the session under `storage_key`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn HttpTransport>,
        endpoints: Endpoints,
        storage_key: impl Into<String>,
    ) -> Self {
        let (failures, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                endpoints,
                storage_key: storage_key.into(),
                current: RwLock::new(None),
                writer: tokio::sync::Mutex::new(()),
                refreshes: SingleFlight::new(),
                authorizer: RwLock::new(None),
                last_failure: Mutex::new(None),
                failures,
            }),
        }
    }

    /// Installs the collaborator that drives provider sign-in pages.
    pub fn set_authorizer(&self, authorizer: Arc<dyn Authorizer>) {
        *self.inner.authorizer.write() = Some(authorizer);
    }

    /// Returns a snapshot of the current session.
    pub fn active_session(&self) -> Option<Session> {
        self.inner.current.read().clone()
    }

    /// Reason of the most recent forced logout.
    pub fn last_failure(&self) -> Option<AuthFailureReason> {
        *self.inner.last_failure.lock()
    }

    /// Subscribes to forced-logout notifications.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<AuthFailureReason> {
        self.inner.failures.subscribe()
    }

    /// Loads the persisted session and validates it against the server.
    ///
    /// Returns the stored session, a refreshed replacement, or `None` when
    /// there is nothing usable. Network trouble keeps the stored session.
    pub async fn restore(&self) -> Option<Session> {
        let stored = {
            let _writer = self.inner.writer.lock().await;
            let stored = self.load_persisted().await?;
            *self.inner.current.write() = Some(stored.clone());
            stored
        };

        // Validation moves the live session itself: refreshed, or cleared.
        let validated = self
            .validate(&stored)
            .await
            .filter(|session| self.is_live(session))?;
        debug!(subject_id = validated.subject_id, "session restored");
        Some(validated)
    }

    /// Checks `session` against the identity endpoint, refreshing once on a
    /// 401.
    ///
    /// A refresh failure ends the session as `refresh_expired`; a refreshed
    /// token that is still rejected ends it as `session_conflict`. Any other
    /// failure keeps the session.
    pub async fn validate(&self, session: &Session) -> Option<Session> {
        let status = match self.identity_status(&session.access_token).await {
            Some(status) => status,
            None => return Some(session.clone()),
        };
        if status != 401 {
            return Some(session.clone());
        }

        let Some(refreshed) = self.refresh(session).await else {
            self.classify_failure(AuthFailureReason::RefreshExpired).await;
            return None;
        };

        match self.identity_status(&refreshed.access_token).await {
            Some(401) => {
                self.classify_failure(AuthFailureReason::SessionConflict)
                    .await;
                None
            }
            _ => Some(refreshed),
        }
    }

    /// Exchanges the refresh token of `base` for a new token pair.
    ///
    /// Concurrent callers share one refresh call. If the live session already
    /// carries a different access token than `base`, it is returned without
    /// calling the server. Returns `None` without a live session, if the
    /// session ended while the call was running, or if the refresh failed
    /// for any reason.
    pub async fn refresh(&self, base: &Session) -> Option<Session> {
        match self.active_session() {
            None => {
                debug!("no live session to refresh");
                return None;
            }
            Some(current) if current.access_token != base.access_token => {
                debug!("session already refreshed");
                return Some(current);
            }
            Some(_) => {}
        }

        let manager = self.clone();
        let base = base.clone();
        self.inner
            .refreshes
            .run((), move || async move { manager.refresh_now(base).await })
            .await
            .unwrap_or(None)
    }

    async fn refresh_now(&self, base: Session) -> Option<Session> {
        debug!("refreshing session");
        let request = HttpRequest::post(
            self.inner.endpoints.refresh.clone(),
            json!({ "refresh_token": base.refresh_token }),
        )
        .with_header("Content-Type", "application/json");

        let response = match self.inner.transport.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "refresh call failed");
                return None;
            }
        };
        if !response.is_success() {
            debug!(status = response.status, "refresh rejected");
            return None;
        }

        let token = |field: &str| {
            response
                .body
                .get(field)
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };
        let (Some(access), Some(refresh)) = (token("accessToken"), token("refreshToken")) else {
            debug!("refresh response is missing tokens");
            return None;
        };

        let next = base.with_tokens(access, refresh);
        match self.replace_live(&base, &next).await {
            Ok(true) => Some(next),
            Ok(false) => {
                debug!("session ended during refresh, dropping new tokens");
                None
            }
            Err(e) => {
                warn!(error = %e, "failed to persist refreshed session");
                None
            }
        }
    }

    /// Signs in with `provider` through the installed [`Authorizer`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LoginCancelled`] if the user backed out and
    /// [`SyncError::LoginFailed`] for every other failure.
    pub async fn login(&self, provider: AuthProvider) -> SyncResult<Session> {
        let authorizer = self
            .inner
            .authorizer
            .read()
            .clone()
            .ok_or_else(|| SyncError::LoginFailed("no authorizer installed".into()))?;
        let callback_url = self.inner.endpoints.login_callback.clone();

        let request = HttpRequest::get(self.inner.endpoints.login_start_for(provider.as_str()))
            .with_query("callback", callback_url.clone());
        let response = self
            .inner
            .transport
            .send(&request)
            .await
            .map_err(|e| SyncError::LoginFailed(friendly_oauth_error(&e.to_string())))?;
        let body = response.into_result().map_err(|e| match e {
            SyncError::HttpStatus { message, .. } | SyncError::Validation { message, .. } => {
                SyncError::LoginFailed(message)
            }
            other => SyncError::LoginFailed(other.to_string()),
        })?;
        let auth_url = body
            .get("authUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| SyncError::LoginFailed("authUrl is missing".into()))?;

        match authorizer.authorize(auth_url, &callback_url).await {
            AuthorizationOutcome::Callback(url) => self.complete_login(&url).await,
            AuthorizationOutcome::Cancelled | AuthorizationOutcome::Dismissed => {
                info!(%provider, "login cancelled");
                Err(SyncError::LoginCancelled)
            }
        }
    }

    /// Finishes a sign-in from the provider's callback URL.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::LoginFailed`] if the callback carries an error or
    /// lacks credentials, or a storage error if the session cannot be saved.
    pub async fn complete_login(&self, callback_url: &str) -> SyncResult<Session> {
        let session = parse_callback(callback_url)?;
        {
            let _writer = self.inner.writer.lock().await;
            self.inner
                .store
                .set_json(&self.inner.storage_key, &session)
                .await?;
            *self.inner.current.write() = Some(session.clone());
        }
        *self.inner.last_failure.lock() = None;
        info!(
            subject_id = session.subject_id,
            provider = %session.auth_provider,
            "signed in"
        );
        Ok(session)
    }

    /// Clears the session from memory and storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted session cannot be removed.
    pub async fn logout(&self) -> SyncResult<()> {
        let (_, removed) = self.clear().await;
        removed?;
        info!("signed out");
        Ok(())
    }

    /// Ends the session after a failure that cannot be repaired and returns
    /// the message to show the user.
    ///
    /// Subscribers hear about a session ending once: callers failing after
    /// it already ended only get the message back.
    pub async fn classify_failure(&self, reason: AuthFailureReason) -> &'static str {
        let (was_live, removed) = self.clear().await;
        if let Err(e) = removed {
            warn!(error = %e, "failed to clear persisted session");
        }

        let first = {
            let mut last = self.inner.last_failure.lock();
            let first = was_live || last.is_none();
            if first {
                *last = Some(reason);
            }
            first
        };
        if first {
            warn!(%reason, "forcing logout");
            // No subscribers is fine.
            let _ = self.inner.failures.send(reason);
        } else {
            debug!(%reason, "session already ended");
        }
        reason.user_message()
    }

    /// Drops the live session and its persisted copy. Reports whether a
    /// session was live.
    async fn clear(&self) -> (bool, SyncResult<()>) {
        let _writer = self.inner.writer.lock().await;
        let was_live = self.inner.current.write().take().is_some();
        let removed = self
            .inner
            .store
            .remove(&self.inner.storage_key)
            .await
            .map_err(SyncError::from);
        (was_live, removed)
    }

    /// Stores `next` in place of `base`, unless `base` stopped being the
    /// live session.
    async fn replace_live(&self, base: &Session, next: &Session) -> SyncResult<bool> {
        let _writer = self.inner.writer.lock().await;
        if !self.is_live(base) {
            return Ok(false);
        }
        self.inner
            .store
            .set_json(&self.inner.storage_key, next)
            .await?;
        *self.inner.current.write() = Some(next.clone());
        Ok(true)
    }

    fn is_live(&self, session: &Session) -> bool {
        self.inner
            .current
            .read()
            .as_ref()
            .is_some_and(|current| current.access_token == session.access_token)
    }

    async fn identity_status(&self, access_token: &str) -> Option<u16> {
        let request = HttpRequest::get(self.inner.endpoints.identity.clone())
            .with_bearer(access_token);
        match self.inner.transport.send(&request).await {
            Ok(response) => Some(response.status),
            Err(e) => {
                debug!(error = %e, "identity check unreachable");
                None
            }
        }
    }

    async fn load_persisted(&self) -> Option<Session> {
        let key = &self.inner.storage_key;
        match self.inner.store.get_json::<Session>(key).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "discarding unreadable session");
                if let Err(e) = self.inner.store.remove(key).await {
                    warn!(error = %e, "failed to remove unreadable session");
                }
                None
            }
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("active", &self.inner.current.read().is_some())
            .field("last_failure", &self.last_failure())
            .finish()
    }
}

/// Parses the query of a sign-in callback URL into a session.
fn parse_callback(callback_url: &str) -> SyncResult<Session> {
    let url = reqwest::Url::parse(callback_url)
        .map_err(|e| SyncError::LoginFailed(format!("invalid callback url: {e}")))?;
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    };

    if let Some(error) = param("error") {
        return Err(SyncError::LoginFailed(friendly_oauth_error(&error)));
    }

    let access_token = param("accessToken");
    let refresh_token = param("refreshToken");
    let subject_id = param("memberId").and_then(|id| id.parse::<u64>().ok());
    let (Some(access_token), Some(refresh_token), Some(subject_id)) =
        (access_token, refresh_token, subject_id.filter(|id| *id != 0))
    else {
        return Err(SyncError::LoginFailed("invalid callback payload".into()));
    };

    Ok(Session {
        access_token,
        refresh_token,
        subject_id,
        display_name: param("nickname").unwrap_or_else(|| "User".to_string()),
        auth_provider: param("provider")
            .and_then(|p| p.parse().ok())
            .unwrap_or(AuthProvider::Kakao),
        email: param("email"),
    })
}

fn friendly_oauth_error(error: &str) -> String {
    let lower = error.to_lowercase();
    if lower.contains("cancel") {
        "Sign-in was cancelled.".to_string()
    } else if lower.contains("state") {
        "Sign-in security check (state) failed. Please try again.".to_string()
    } else if lower.contains("network") || lower.contains("failed to fetch") {
        "The network connection is unstable. Please try again once connected.".to_string()
    } else {
        format!("Sign-in failed: {error}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Method, MockTransport};
    use pecal_storage::MemoryStore;
    use std::time::Duration;

    const ME: &str = "/api/auth/external/me";
    const REFRESH: &str = "/api/auth/external/refresh";

    fn session(access: &str, refresh: &str) -> Session {
        Session {
            access_token: access.into(),
            refresh_token: refresh.into(),
            subject_id: 7,
            display_name: "Mina".into(),
            auth_provider: AuthProvider::Google,
            email: None,
        }
    }

    fn manager() -> (SessionManager, Arc<MockTransport>, Arc<MemoryStore>) {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(
            store.clone(),
            transport.clone(),
            Endpoints::default(),
            "pecal_mobile_auth",
        );
        (manager, transport, store)
    }

    async fn seed(store: &MemoryStore, session: &Session) {
        store.set_json("pecal_mobile_auth", session).await.unwrap();
    }

    #[test]
    fn session_json_is_camel_case() {
        let value = serde_json::to_value(session("a", "r")).unwrap();
        assert_eq!(value["accessToken"], "a");
        assert_eq!(value["subjectId"], 7);
        assert_eq!(value["authProvider"], "google");
        assert!(value.get("email").is_none());
    }

    #[test]
    fn debug_redacts_tokens() {
        let rendered = format!("{:?}", session("secret-access", "secret-refresh"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn provider_parsing() {
        assert_eq!("Apple".parse::<AuthProvider>().unwrap(), AuthProvider::Apple);
        assert!("github".parse::<AuthProvider>().is_err());
    }

    #[test]
    fn callback_parsing() {
        let session = parse_callback(
            "pecal://auth/callback?accessToken=a1&refreshToken=r1&memberId=42&provider=apple&email=m%40x.io",
        )
        .unwrap();
        assert_eq!(session.subject_id, 42);
        assert_eq!(session.display_name, "User");
        assert_eq!(session.auth_provider, AuthProvider::Apple);
        assert_eq!(session.email.as_deref(), Some("m@x.io"));

        let err = parse_callback("pecal://auth/callback?accessToken=a1&memberId=42").unwrap_err();
        assert!(matches!(err, SyncError::LoginFailed(_)));

        let err = parse_callback("pecal://auth/callback?error=state_mismatch").unwrap_err();
        assert!(err.to_string().contains("state"));
    }

    #[tokio::test]
    async fn restore_without_stored_session() {
        let (manager, transport, _) = manager();
        assert!(manager.restore().await.is_none());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn restore_valid_session() {
        let (manager, transport, store) = manager();
        seed(&store, &session("a1", "r1")).await;
        transport.respond_always(Method::Get, ME, 200, json!({ "id": 7 }));

        let restored = manager.restore().await.unwrap();
        assert_eq!(restored.access_token, "a1");
        assert_eq!(manager.active_session(), Some(restored));
        assert_eq!(transport.calls(Method::Post, REFRESH), 0);
    }

    #[tokio::test]
    async fn restore_offline_keeps_session() {
        let (manager, transport, store) = manager();
        seed(&store, &session("a1", "r1")).await;
        transport.set_connected(false);

        let restored = manager.restore().await.unwrap();
        assert_eq!(restored.access_token, "a1");
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn restore_refreshes_expired_token() {
        let (manager, transport, store) = manager();
        seed(&store, &session("a1", "r1")).await;
        transport.respond(Method::Get, ME, 401, json!({}));
        transport.respond(Method::Get, ME, 200, json!({}));
        transport.respond(
            Method::Post,
            REFRESH,
            200,
            json!({ "accessToken": "a2", "refreshToken": "r2" }),
        );

        let restored = manager.restore().await.unwrap();
        assert_eq!(restored.access_token, "a2");
        assert_eq!(restored.display_name, "Mina");
        let persisted: Session = store.get_json("pecal_mobile_auth").await.unwrap().unwrap();
        assert_eq!(persisted.refresh_token, "r2");

        let refresh = &transport.requests()[1];
        assert_eq!(refresh.body, Some(json!({ "refresh_token": "r1" })));
    }

    #[tokio::test]
    async fn restore_with_rejected_refresh_expires() {
        let (manager, transport, store) = manager();
        seed(&store, &session("a1", "r1")).await;
        transport.respond(Method::Get, ME, 401, json!({}));
        transport.respond(Method::Post, REFRESH, 401, json!({}));
        let mut failures = manager.subscribe_failures();

        assert!(manager.restore().await.is_none());
        assert!(manager.active_session().is_none());
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_none());
        assert_eq!(manager.last_failure(), Some(AuthFailureReason::RefreshExpired));
        assert_eq!(
            failures.recv().await.unwrap(),
            AuthFailureReason::RefreshExpired
        );
    }

    #[tokio::test]
    async fn restore_detects_conflict() {
        let (manager, transport, store) = manager();
        seed(&store, &session("a1", "r1")).await;
        transport.respond_always(Method::Get, ME, 401, json!({}));
        transport.respond(
            Method::Post,
            REFRESH,
            200,
            json!({ "accessToken": "a2", "refreshToken": "r2" }),
        );

        assert!(manager.restore().await.is_none());
        assert_eq!(
            manager.last_failure(),
            Some(AuthFailureReason::SessionConflict)
        );
    }

    #[tokio::test]
    async fn restore_discards_corrupt_session() {
        let (manager, _, store) = manager();
        store
            .set("pecal_mobile_auth", "{not json".to_string())
            .await
            .unwrap();

        assert!(manager.restore().await.is_none());
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_none());
    }

    async fn restored(
        manager: &SessionManager,
        transport: &MockTransport,
        store: &MemoryStore,
    ) -> Session {
        seed(store, &session("a1", "r1")).await;
        transport.respond_always(Method::Get, ME, 200, json!({}));
        manager.restore().await.unwrap()
    }

    #[tokio::test]
    async fn refresh_missing_tokens_fails() {
        let (manager, transport, store) = manager();
        let live = restored(&manager, &transport, &store).await;
        transport.respond(Method::Post, REFRESH, 200, json!({ "accessToken": "a2" }));

        assert!(manager.refresh(&live).await.is_none());
        assert_eq!(transport.calls(Method::Post, REFRESH), 1);
        assert_eq!(manager.active_session(), Some(live));
    }

    #[tokio::test]
    async fn refresh_without_live_session_makes_no_call() {
        let (manager, transport, store) = manager();
        let live = restored(&manager, &transport, &store).await;
        manager.logout().await.unwrap();

        assert!(manager.refresh(&live).await.is_none());
        assert_eq!(transport.calls(Method::Post, REFRESH), 0);
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_finishing_after_logout_is_dropped() {
        let (manager, transport, store) = manager();
        let live = restored(&manager, &transport, &store).await;
        transport.set_latency(Duration::from_millis(50));
        transport.respond(
            Method::Post,
            REFRESH,
            200,
            json!({ "accessToken": "a2", "refreshToken": "r2" }),
        );

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.refresh(&live).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout().await.unwrap();

        assert!(pending.await.unwrap().is_none());
        assert_eq!(transport.calls(Method::Post, REFRESH), 1);
        assert!(manager.active_session().is_none());
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_none());

        let next_start = SessionManager::new(
            store.clone(),
            transport.clone(),
            Endpoints::default(),
            "pecal_mobile_auth",
        );
        assert!(next_start.restore().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_refreshes_share_one_call() {
        let (manager, transport, store) = manager();
        seed(&store, &session("a1", "r1")).await;
        transport.respond_always(Method::Get, ME, 200, json!({}));
        manager.restore().await.unwrap();
        transport.set_latency(Duration::from_millis(50));
        transport.respond(
            Method::Post,
            REFRESH,
            200,
            json!({ "accessToken": "a2", "refreshToken": "r2" }),
        );

        let base = session("a1", "r1");
        let mut handles = Vec::new();
        for _ in 0..6 {
            let manager = manager.clone();
            let base = base.clone();
            handles.push(tokio::spawn(async move { manager.refresh(&base).await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().access_token, "a2");
        }
        assert_eq!(transport.calls(Method::Post, REFRESH), 1);

        // A late caller holding the old token gets the new session for free.
        let late = manager.refresh(&base).await.unwrap();
        assert_eq!(late.access_token, "a2");
        assert_eq!(transport.calls(Method::Post, REFRESH), 1);
    }

    #[tokio::test]
    async fn classify_failure_logs_out() {
        let (manager, _, store) = manager();
        manager
            .complete_login("pecal://auth/callback?accessToken=a&refreshToken=r&memberId=1")
            .await
            .unwrap();

        let message = manager
            .classify_failure(AuthFailureReason::SessionConflict)
            .await;
        assert!(message.contains("another device"));
        assert!(manager.active_session().is_none());
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn forced_logout_is_announced_once() {
        let (manager, transport, store) = manager();
        restored(&manager, &transport, &store).await;
        let mut failures = manager.subscribe_failures();

        for _ in 0..3 {
            let message = manager
                .classify_failure(AuthFailureReason::RefreshExpired)
                .await;
            assert_eq!(message, AuthFailureReason::RefreshExpired.user_message());
        }
        manager
            .classify_failure(AuthFailureReason::SessionConflict)
            .await;

        assert_eq!(
            failures.try_recv().unwrap(),
            AuthFailureReason::RefreshExpired
        );
        assert!(failures.try_recv().is_err());
        assert_eq!(manager.last_failure(), Some(AuthFailureReason::RefreshExpired));

        // A new sign-in arms the notification again.
        manager
            .complete_login("pecal://auth/callback?accessToken=b&refreshToken=s&memberId=1")
            .await
            .unwrap();
        manager
            .classify_failure(AuthFailureReason::SessionConflict)
            .await;
        assert_eq!(
            failures.try_recv().unwrap(),
            AuthFailureReason::SessionConflict
        );
    }

    struct ScriptedAuthorizer(AuthorizationOutcome);

    #[async_trait]
    impl Authorizer for ScriptedAuthorizer {
        async fn authorize(&self, auth_url: &str, callback_url: &str) -> AuthorizationOutcome {
            assert_eq!(auth_url, "https://kauth.example/authorize");
            assert_eq!(callback_url, "pecal://auth/callback");
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn login_flow() {
        let (manager, transport, store) = manager();
        transport.respond_always(
            Method::Get,
            "/api/auth/kakao/start",
            200,
            json!({ "authUrl": "https://kauth.example/authorize" }),
        );

        let err = manager.login(AuthProvider::Kakao).await.unwrap_err();
        assert!(matches!(err, SyncError::LoginFailed(_)));

        manager.set_authorizer(Arc::new(ScriptedAuthorizer(AuthorizationOutcome::Cancelled)));
        assert!(matches!(
            manager.login(AuthProvider::Kakao).await,
            Err(SyncError::LoginCancelled)
        ));

        manager.set_authorizer(Arc::new(ScriptedAuthorizer(AuthorizationOutcome::Callback(
            "pecal://auth/callback?accessToken=a1&refreshToken=r1&memberId=9&nickname=Jun".into(),
        ))));
        let session = manager.login(AuthProvider::Kakao).await.unwrap();
        assert_eq!(session.display_name, "Jun");
        assert_eq!(manager.active_session(), Some(session));
        assert!(store.get("pecal_mobile_auth").await.unwrap().is_some());

        let start = transport
            .requests()
            .into_iter()
            .find(|r| r.path == "/api/auth/kakao/start")
            .unwrap();
        assert_eq!(start.query_param("callback"), Some("pecal://auth/callback"));
    }
}
