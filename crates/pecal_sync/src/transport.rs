//! Transport layer abstraction.
//!
//! Everything above this module talks to the server through
//! [`HttpTransport`]. A transport only moves bytes: a request that produced
//! any HTTP response returns `Ok`, whatever the status, and a request that
//! never reached the server fails with [`SyncError::NetworkUnavailable`].

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
}

impl Method {
    /// Upper-case method name.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request relative to the configured server.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Method.
    pub method: Method,
    /// Path, starting with `/`.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Creates a request without a body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Creates a GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Creates a POST request with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_json(body)
    }

    /// Creates a PUT request with a JSON body.
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, path).with_json(body)
    }

    /// Creates a PATCH request with a JSON body.
    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, path).with_json(body)
    }

    /// Creates a DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Sets the JSON body.
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Sets a header, replacing any previous value (names compare
    /// case-insensitively).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Sets the `Authorization: Bearer` header.
    pub fn with_bearer(self, token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {token}"))
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the bearer token, if one is attached.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("Authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
    }

    /// Returns a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A response from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Decoded body; `Null` when empty.
    pub body: Value,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Creates a 200 response.
    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts into the body, or the classified error for a failure status.
    pub fn into_result(self) -> SyncResult<Value> {
        if self.is_success() {
            Ok(self.body)
        } else {
            Err(SyncError::from_status(self.status, self.body))
        }
    }
}

/// Carries requests to the server.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NetworkUnavailable`] when no response was
    /// received. Non-success statuses are returned as `Ok`.
    async fn send(&self, request: &HttpRequest) -> SyncResult<HttpResponse>;
}

type RouteKey = (Method, String);

/// A scripted transport for testing.
///
/// Replies are looked up by method and path. One-shot replies queued with
/// [`MockTransport::respond`] are served first, then the sticky reply set by
/// [`MockTransport::respond_always`], then a 404.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    latency: Mutex<Option<Duration>>,
    queued: Mutex<HashMap<RouteKey, VecDeque<SyncResult<HttpResponse>>>>,
    sticky: Mutex<HashMap<RouteKey, HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Queues a one-shot reply.
    pub fn respond(&self, method: Method, path: &str, status: u16, body: Value) {
        self.queued
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Ok(HttpResponse::new(status, body)));
    }

    /// Sets the reply used once the one-shot replies for a route run out.
    pub fn respond_always(&self, method: Method, path: &str, status: u16, body: Value) {
        self.sticky
            .lock()
            .insert((method, path.to_string()), HttpResponse::new(status, body));
    }

    /// Makes the next call to a route fail as if the network dropped.
    pub fn fail_next(&self, method: Method, path: &str, message: &str) {
        self.queued
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(Err(SyncError::network(message)));
    }

    /// Sets the connected state. A disconnected mock fails every call.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns the connected state.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Delays every reply.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Returns every request received, in order.
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

    fn next_reply(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let key = (request.method, request.path.clone());
        if let Some(reply) = self
            .queued
            .lock()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        Ok(self.sticky.lock().get(&key).cloned().unwrap_or_else(|| {
            HttpResponse::new(404, json!({ "error": format!("no reply for {} {}", key.0, key.1) }))
        }))
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> SyncResult<HttpResponse> {
        self.requests.lock().push(request.clone());

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.is_connected() {
            return Err(SyncError::network("mock transport disconnected"));
        }
        self.next_reply(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builders() {
        let request = HttpRequest::post("/api/tasks", json!({ "title": "a" }))
            .with_bearer("tok")
            .with_header("authorization", "Bearer other")
            .with_query("callback", "pecal://auth");

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.bearer_token(), Some("other"));
        assert_eq!(request.headers.len(), 1);
        assert_eq!(request.query_param("callback"), Some("pecal://auth"));
        assert_eq!(request.body, Some(json!({ "title": "a" })));
    }

    #[test]
    fn response_into_result() {
        assert_eq!(
            HttpResponse::ok(json!([1])).into_result().unwrap(),
            json!([1])
        );
        let err = HttpResponse::new(404, json!({ "error": "gone" }))
            .into_result()
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn mock_serves_queued_then_sticky() {
        let transport = MockTransport::new();
        transport.respond(Method::Get, "/a", 500, json!({}));
        transport.respond_always(Method::Get, "/a", 200, json!({ "ok": true }));

        let request = HttpRequest::get("/a");
        assert_eq!(transport.send(&request).await.unwrap().status, 500);
        assert_eq!(transport.send(&request).await.unwrap().status, 200);
        assert_eq!(transport.send(&request).await.unwrap().status, 200);
        assert_eq!(transport.calls(Method::Get, "/a"), 3);

        let missing = transport.send(&HttpRequest::get("/b")).await.unwrap();
        assert_eq!(missing.status, 404);
    }

    #[tokio::test]
    async fn mock_connection() {
        let transport = MockTransport::new();
        transport.respond_always(Method::Get, "/a", 200, json!({}));
        assert!(transport.is_connected());

        transport.set_connected(false);
        let err = transport.send(&HttpRequest::get("/a")).await.unwrap_err();
        assert!(matches!(err, SyncError::NetworkUnavailable { .. }));

        transport.set_connected(true);
        transport.fail_next(Method::Get, "/a", "reset");
        assert!(transport.send(&HttpRequest::get("/a")).await.is_err());
        assert!(transport.send(&HttpRequest::get("/a")).await.is_ok());
    }
}
