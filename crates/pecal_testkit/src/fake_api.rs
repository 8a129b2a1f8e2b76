//! A stateful in-process stand-in for the Pecal API.
//!
//! [`FakeApi`] implements [`HttpTransport`] and keeps enough server state to
//! exercise the sync core end to end: rotating token families, sign-ins on
//! other devices, task and memo collections with versioned memos, injected
//! failures and an offline switch.

use async_trait::async_trait;
use parking_lot::Mutex;
use pecal_sync::{
    AuthProvider, HttpRequest, HttpResponse, HttpTransport, Method, Session, SyncError,
    SyncResult,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Identity endpoint.
pub const IDENTITY_PATH: &str = "/api/auth/external/me";
/// Refresh endpoint.
pub const REFRESH_PATH: &str = "/api/auth/external/refresh";
/// Task collection.
pub const TASKS_PATH: &str = "/api/tasks";
/// Memo collection.
pub const MEMOS_PATH: &str = "/api/memos";

#[derive(Debug, Clone)]
struct TokenFamily {
    subject_id: u64,
    access: String,
    refresh: String,
    access_expired: bool,
    refresh_revoked: bool,
    superseded: bool,
}

#[derive(Debug, Clone)]
enum Injected {
    Status(u16, Value),
    Network,
}

#[derive(Debug, Default)]
struct ApiState {
    families: Vec<TokenFamily>,
    next_token: u64,
    next_id: u64,
    tasks: Vec<Value>,
    memos: BTreeMap<u64, (Value, u64)>,
    injected: HashMap<(Method, String), VecDeque<Injected>>,
}

impl ApiState {
    fn token(&mut self, kind: &str) -> String {
        self.next_token += 1;
        format!("{kind}-{}", self.next_token)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn family_by_access(&self, token: &str) -> Option<&TokenFamily> {
        self.families.iter().find(|f| f.access == token)
    }

    fn authorized(&self, request: &HttpRequest) -> Option<u64> {
        let token = request.bearer_token()?;
        self.family_by_access(token)
            .filter(|f| !f.access_expired && !f.superseded)
            .map(|f| f.subject_id)
    }
}

/// Simulated backend.
#[derive(Debug)]
pub struct FakeApi {
    state: Mutex<ApiState>,
    online: AtomicBool,
    latency: Mutex<Option<Duration>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeApi {
    /// Creates an empty, online backend.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ApiState::default()),
            online: AtomicBool::new(true),
            latency: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Signs `subject_id` in and returns the new session.
    pub fn issue_session(&self, subject_id: u64, display_name: &str) -> Session {
        let mut state = self.state.lock();
        let access = state.token("access");
        let refresh = state.token("refresh");
        state.families.push(TokenFamily {
            subject_id,
            access: access.clone(),
            refresh: refresh.clone(),
            access_expired: false,
            refresh_revoked: false,
            superseded: false,
        });
        Session {
            access_token: access,
            refresh_token: refresh,
            subject_id,
            display_name: display_name.to_string(),
            auth_provider: AuthProvider::Kakao,
            email: None,
        }
    }

    /// Makes the current access token of `session` expire. Its refresh
    /// token keeps working.
    pub fn expire_access(&self, session: &Session) {
        let mut state = self.state.lock();
        if let Some(family) = state
            .families
            .iter_mut()
            .find(|f| f.access == session.access_token)
        {
            family.access_expired = true;
        }
    }

    /// Makes the refresh token of `session` unusable.
    pub fn revoke_refresh(&self, session: &Session) {
        let mut state = self.state.lock();
        if let Some(family) = state
            .families
            .iter_mut()
            .find(|f| f.refresh == session.refresh_token)
        {
            family.refresh_revoked = true;
        }
    }

    /// Signs the same account in on another device. Every older token
    /// family of the account keeps refreshing but its access tokens are
    /// rejected from now on.
    pub fn login_elsewhere(&self, subject_id: u64) -> Session {
        {
            let mut state = self.state.lock();
            for family in state
                .families
                .iter_mut()
                .filter(|f| f.subject_id == subject_id)
            {
                family.superseded = true;
            }
        }
        self.issue_session(subject_id, "Other device")
    }

    /// Returns true if `token` is currently accepted.
    pub fn is_valid_access(&self, token: &str) -> bool {
        self.state
            .lock()
            .family_by_access(token)
            .is_some_and(|f| !f.access_expired && !f.superseded)
    }

    /// Switches the network on or off.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Delays every response.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Makes the next call to a route answer with `status`.
    pub fn fail_next(&self, method: Method, path: &str, status: u16, body: Value) {
        self.state
            .lock()
            .injected
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Injected::Status(status, body));
    }

    /// Makes the next call to a route fail without a response.
    pub fn drop_next(&self, method: Method, path: &str) {
        self.state
            .lock()
            .injected
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Injected::Network);
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests received for a route.
    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }

    /// Tasks created so far.
    pub fn tasks(&self) -> Vec<Value> {
        self.state.lock().tasks.clone()
    }

    /// Creates a memo on the server and returns its id.
    pub fn seed_memo(&self, content: Value) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.memos.insert(id, (content, 1));
        id
    }

    /// Edits a memo as another device would, bumping its version.
    pub fn edit_memo_remotely(&self, id: u64, content: Value) {
        if let Some(memo) = self.state.lock().memos.get_mut(&id) {
            memo.0 = content;
            memo.1 += 1;
        }
    }

    /// Current content and version of a memo.
    pub fn memo(&self, id: u64) -> Option<(Value, u64)> {
        self.state.lock().memos.get(&id).cloned()
    }

    fn handle(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let mut state = self.state.lock();

        if let Some(injected) = state
            .injected
            .get_mut(&(request.method, request.path.clone()))
            .and_then(VecDeque::pop_front)
        {
            return match injected {
                Injected::Status(status, body) => Ok(HttpResponse::new(status, body)),
                Injected::Network => Err(SyncError::network("connection reset")),
            };
        }

        let path = request.path.as_str();
        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();

        let response = match (request.method, segments.as_slice()) {
            (Method::Post, ["api", "auth", "external", "refresh"]) => {
                let presented = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("refresh_token"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let access = state.token("access");
                let refresh = state.token("refresh");
                match state
                    .families
                    .iter_mut()
                    .find(|f| f.refresh == presented && !f.refresh_revoked)
                {
                    Some(family) => {
                        family.access = access.clone();
                        family.refresh = refresh.clone();
                        family.access_expired = false;
                        HttpResponse::ok(json!({ "accessToken": access, "refreshToken": refresh }))
                    }
                    None => HttpResponse::new(401, json!({ "error": "invalid refresh token" })),
                }
            }
            (Method::Get, ["api", "auth", provider, "start"]) => {
                let callback = request.query_param("callback").unwrap_or_default();
                HttpResponse::ok(json!({
                    "authUrl": format!("https://auth.fake/{provider}?callback={callback}")
                }))
            }
            _ => {
                let Some(subject_id) = state.authorized(request) else {
                    return Ok(HttpResponse::new(401, json!({ "error": "unauthorized" })));
                };
                route_data(&mut state, request, &segments, subject_id)
            }
        };
        Ok(response)
    }
}

fn route_data(
    state: &mut ApiState,
    request: &HttpRequest,
    segments: &[&str],
    subject_id: u64,
) -> HttpResponse {
    match (request.method, segments) {
        (Method::Get, ["api", "auth", "external", "me"]) => {
            HttpResponse::ok(json!({ "memberId": subject_id }))
        }
        (Method::Get, ["api", "tasks"]) => HttpResponse::ok(Value::Array(state.tasks.clone())),
        (Method::Post, ["api", "tasks"]) => {
            let body = request.body.clone().unwrap_or(Value::Null);
            let title = body.get("title").and_then(Value::as_str).unwrap_or_default();
            if title.trim().is_empty() {
                return HttpResponse::new(400, json!({ "error": "title is required" }));
            }
            let id = state.next_id();
            let mut task = body.clone();
            if let Some(map) = task.as_object_mut() {
                map.insert("id".into(), json!(id));
            }
            state.tasks.push(task.clone());
            HttpResponse::new(201, task)
        }
        (Method::Get, ["api", "memos"]) => {
            let memos: Vec<Value> = state
                .memos
                .iter()
                .map(|(id, (content, version))| memo_json(*id, content, *version))
                .collect();
            HttpResponse::ok(Value::Array(memos))
        }
        (Method::Post, ["api", "memos"]) => {
            let content = request.body.clone().unwrap_or(Value::Null);
            let id = state.next_id();
            state.memos.insert(id, (content.clone(), 1));
            HttpResponse::new(201, memo_json(id, &content, 1))
        }
        (Method::Get, ["api", "memos", raw]) => match parse_id(raw).and_then(|id| {
            state
                .memos
                .get(&id)
                .map(|(content, version)| memo_json(id, content, *version))
        }) {
            Some(memo) => HttpResponse::ok(memo),
            None => HttpResponse::new(404, json!({ "error": "memo not found" })),
        },
        (Method::Put, ["api", "memos", raw]) => {
            let content = request.body.clone().unwrap_or(Value::Null);
            let Some(id) = parse_id(raw) else {
                return HttpResponse::new(404, json!({ "error": "memo not found" }));
            };
            match state.memos.get_mut(&id) {
                Some(memo) => {
                    memo.0 = content;
                    memo.1 += 1;
                    HttpResponse::ok(memo_json(id, &memo.0, memo.1))
                }
                None => HttpResponse::new(404, json!({ "error": "memo not found" })),
            }
        }
        _ => HttpResponse::new(404, json!({ "error": format!("no route for {}", request.path) })),
    }
}

fn parse_id(raw: &str) -> Option<u64> {
    raw.parse().ok()
}

fn memo_json(id: u64, content: &Value, version: u64) -> Value {
    json!({ "id": id, "content": content, "version": version })
}

#[async_trait]
impl HttpTransport for FakeApi {
    async fn send(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        self.requests.lock().push(request.clone());
        debug!(method = %request.method, path = %request.path, "fake api request");

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::network("offline"));
        }
        self.handle(request)
    }
}
