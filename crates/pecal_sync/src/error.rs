//! Error types for the sync core.

use pecal_storage::StorageError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Why a session was forcibly ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFailureReason {
    /// A protected call was rejected and there was no session to refresh.
    Unauthorized,
    /// A refreshed token was rejected too: another login replaced this token family.
    SessionConflict,
    /// The refresh call itself failed.
    RefreshExpired,
}

impl AuthFailureReason {
    /// Message shown to the user after the forced logout.
    pub fn user_message(self) -> &'static str {
        match self {
            AuthFailureReason::Unauthorized => {
                "Authentication is required. Please sign in again."
            }
            AuthFailureReason::SessionConflict => {
                "Your session ended because this account signed in on another device. Please sign in again."
            }
            AuthFailureReason::RefreshExpired => "Your sign-in has expired. Please sign in again.",
        }
    }

    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            AuthFailureReason::Unauthorized => "UNAUTHORIZED",
            AuthFailureReason::SessionConflict => "SESSION_CONFLICT",
            AuthFailureReason::RefreshExpired => "REFRESH_EXPIRED",
        }
    }
}

impl fmt::Display for AuthFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuthFailureReason::Unauthorized => "unauthorized",
            AuthFailureReason::SessionConflict => "session_conflict",
            AuthFailureReason::RefreshExpired => "refresh_expired",
        })
    }
}

/// Errors that can occur during sync operations.
///
/// Dispatch happens on the variant. `status` and `body` are kept only for
/// diagnostics.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    /// The request never produced an HTTP response.
    #[error("network unavailable: {message}")]
    NetworkUnavailable {
        /// Transport message.
        message: String,
    },

    /// The server answered with a non-success status outside the 4xx
    /// validation range.
    #[error("request failed with status {status}: {message}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Message taken from the response body.
        message: String,
        /// Raw response body.
        body: Value,
    },

    /// 401 with no session, or before any refresh was attempted.
    #[error("authentication required")]
    Unauthorized,

    /// 401 persisted after a successful refresh.
    #[error("session was invalidated by a sign-in on another device")]
    SessionConflict,

    /// The refresh call itself failed.
    #[error("session refresh failed")]
    RefreshExpired,

    /// The server rejected the request (4xx other than 401, 408, 429).
    #[error("request rejected with status {status}: {message}")]
    Validation {
        /// HTTP status code.
        status: u16,
        /// Message taken from the response body.
        message: String,
        /// Raw response body.
        body: Value,
    },

    /// A response did not have the expected shape.
    #[error("invalid response: {0}")]
    Decode(String),

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The login flow failed.
    #[error("login failed: {0}")]
    LoginFailed(String),

    /// The user cancelled or dismissed the login flow.
    #[error("login cancelled")]
    LoginCancelled,

    /// A shared in-flight call ended without producing a result.
    #[error("in-flight call ended without a result")]
    Aborted,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkUnavailable {
            message: message.into(),
        }
    }

    /// Classifies a non-success HTTP response.
    pub fn from_status(status: u16, body: Value) -> Self {
        let message = body_message(&body).unwrap_or_else(|| format!("request failed: {status}"));
        match status {
            401 => SyncError::Unauthorized,
            408 | 429 | 500..=599 => SyncError::HttpStatus {
                status,
                message,
                body,
            },
            400..=499 => SyncError::Validation {
                status,
                message,
                body,
            },
            _ => SyncError::HttpStatus {
                status,
                message,
                body,
            },
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::NetworkUnavailable { .. } => true,
            SyncError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Returns true if repeating the same request can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, SyncError::Validation { .. })
    }

    /// Returns the HTTP status behind this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::HttpStatus { status, .. } | SyncError::Validation { status, .. } => {
                Some(*status)
            }
            SyncError::Unauthorized | SyncError::SessionConflict | SyncError::RefreshExpired => {
                Some(401)
            }
            _ => None,
        }
    }

    /// Returns the terminal auth reason carried by this error.
    pub fn auth_failure(&self) -> Option<AuthFailureReason> {
        match self {
            SyncError::Unauthorized => Some(AuthFailureReason::Unauthorized),
            SyncError::SessionConflict => Some(AuthFailureReason::SessionConflict),
            SyncError::RefreshExpired => Some(AuthFailureReason::RefreshExpired),
            _ => None,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NetworkUnavailable { .. } => "NETWORK_ERROR",
            SyncError::HttpStatus { status, .. } => match status {
                408 => "TIMEOUT",
                429 => "RATE_LIMITED",
                500..=599 => "SERVER_ERROR",
                _ => "REQUEST_FAILED",
            },
            SyncError::Validation { status, .. } => match status {
                400 => "BAD_REQUEST",
                403 => "FORBIDDEN",
                404 => "NOT_FOUND",
                409 => "CONFLICT",
                422 => "VALIDATION_FAILED",
                _ => "REQUEST_FAILED",
            },
            SyncError::Unauthorized => AuthFailureReason::Unauthorized.code(),
            SyncError::SessionConflict => AuthFailureReason::SessionConflict.code(),
            SyncError::RefreshExpired => AuthFailureReason::RefreshExpired.code(),
            SyncError::Decode(_) => "INVALID_RESPONSE",
            SyncError::Storage(_) => "STORAGE_ERROR",
            SyncError::LoginFailed(_) => "LOGIN_FAILED",
            SyncError::LoginCancelled => "LOGIN_CANCELLED",
            SyncError::Aborted => "ABORTED",
        }
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        if let Some(reason) = self.auth_failure() {
            return reason.user_message().to_string();
        }
        match self {
            SyncError::NetworkUnavailable { .. } => "Check your network connection.".to_string(),
            SyncError::HttpStatus { message, .. } | SyncError::Validation { message, .. } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}

/// Returns true for statuses worth retrying: 408, 429 and 5xx.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Pulls a human-readable message out of an error body.
pub(crate) fn body_message(body: &Value) -> Option<String> {
    ["error", "message"]
        .iter()
        .find_map(|field| body.get(field).and_then(Value::as_str))
        .filter(|message| !message.trim().is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network("connection reset").is_retryable());
        assert!(SyncError::from_status(503, json!({})).is_retryable());
        assert!(SyncError::from_status(429, json!({})).is_retryable());
        assert!(SyncError::from_status(408, json!({})).is_retryable());
        assert!(!SyncError::from_status(404, json!({})).is_retryable());
        assert!(!SyncError::from_status(422, json!({})).is_retryable());
        assert!(!SyncError::SessionConflict.is_retryable());
        assert!(!SyncError::RefreshExpired.is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            SyncError::from_status(401, json!({})),
            SyncError::Unauthorized
        ));
        assert!(matches!(
            SyncError::from_status(409, json!({})),
            SyncError::Validation { status: 409, .. }
        ));
        assert!(matches!(
            SyncError::from_status(502, json!({})),
            SyncError::HttpStatus { status: 502, .. }
        ));
        assert!(SyncError::from_status(400, json!({})).is_permanent());
        assert!(!SyncError::from_status(500, json!({})).is_permanent());
    }

    #[test]
    fn message_comes_from_body() {
        let err = SyncError::from_status(400, json!({ "error": "title is required" }));
        assert_eq!(err.user_message(), "title is required");

        let err = SyncError::from_status(500, json!({ "message": "db down" }));
        assert!(err.to_string().contains("db down"));

        let err = SyncError::from_status(404, json!({ "error": "" }));
        assert_eq!(err.user_message(), "request failed: 404");
    }

    #[test]
    fn auth_codes_and_messages() {
        assert_eq!(SyncError::SessionConflict.code(), "SESSION_CONFLICT");
        assert_eq!(
            SyncError::RefreshExpired.auth_failure(),
            Some(AuthFailureReason::RefreshExpired)
        );
        assert_ne!(
            AuthFailureReason::SessionConflict.user_message(),
            AuthFailureReason::RefreshExpired.user_message()
        );
        assert_eq!(AuthFailureReason::RefreshExpired.to_string(), "refresh_expired");
        assert_eq!(SyncError::network("x").code(), "NETWORK_ERROR");
    }
}
