//! Error types for the Google Workspace MCP Server
//!
//! Every failure that leaves the call pipeline is a [`WorkspaceError`], whose
//! [`ErrorKind`] is one of a closed set of categories. Lower level failures
//! (OAuth, configuration) have their own enums and convert into it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Boxed error accepted by [`WorkspaceError::with_cause`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Retained cause; shared so an error can be handed to several callers
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for Workspace MCP operations
pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// Category of a [`WorkspaceError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Permission,
    NotFound,
    RateLimit,
    InvalidRequest,
    Unexpected,
}

impl ErrorKind {
    /// Stable name used in serialized errors
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::Permission => "PermissionError",
            ErrorKind::NotFound => "ResourceNotFoundError",
            ErrorKind::RateLimit => "RateLimitError",
            ErrorKind::InvalidRequest => "InvalidRequestError",
            ErrorKind::Unexpected => "UnexpectedError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain error produced at the boundary nearest a remote call.
///
/// Clones share the same cause, so every caller that waited on one failed
/// call can still reach the original error through `source()`.
#[derive(Debug, Clone)]
pub struct WorkspaceError {
    kind: ErrorKind,
    message: String,
    details: Map<String, Value>,
    retry_after: Option<Duration>,
    cause: Option<SharedError>,
}

impl fmt::Display for WorkspaceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkspaceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl WorkspaceError {
    /// Create an error of the given kind with no details or cause
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Map::new(),
            retry_after: None,
            cause: None,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permission, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Rate limit error carrying the suggested wait before retrying
    pub fn rate_limit(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::new(ErrorKind::RateLimit, message)
            .with_detail("retry_after", json!(retry_after.as_secs()))
            .with_retry_after(retry_after)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unexpected, message)
    }

    /// Attach a structured detail
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Attach the underlying cause
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        let cause: BoxError = cause.into();
        self.cause = Some(Arc::from(cause));
        self
    }

    fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &Map<String, Value> {
        &self.details
    }

    /// Suggested wait before retrying (rate limit errors only)
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// The wrapped cause, if any
    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// Serialize to the `{"error": {type, message, details}}` shape
    pub fn to_json(&self) -> Value {
        json!({
            "error": {
                "type": self.kind.as_str(),
                "message": self.message,
                "details": self.details,
            }
        })
    }
}

/// OAuth authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("OAuth client secrets file not found at {path}. Download OAuth 2.0 credentials from Google Cloud Console.")]
    KeysFileNotFound { path: String },

    #[error("Invalid OAuth keys format: expected 'installed' or 'web' credentials")]
    InvalidKeysFormat,

    #[error("Failed to refresh access token: {message}")]
    TokenRefreshFailed { message: String },

    #[error("OAuth callback error: {message}")]
    CallbackError { message: String },

    #[error("No authorization code provided")]
    NoAuthCode,

    #[error("Token exchange failed: {message}")]
    TokenExchangeFailed { message: String },

    #[error("Failed to save authentication credentials: {message}")]
    PersistFailed { message: String },

    #[error("Unknown service: {service} {version}")]
    UnknownService { service: String, version: String },
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config directory not found: {path}")]
    DirNotFound { path: String },

    #[error("Failed to create config directory: {path}")]
    DirCreationFailed { path: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl From<AuthError> for WorkspaceError {
    fn from(err: AuthError) -> Self {
        let message = match &err {
            AuthError::KeysFileNotFound { .. } | AuthError::InvalidKeysFormat => err.to_string(),
            AuthError::TokenRefreshFailed { .. } => {
                "Failed to refresh authentication credentials. Please re-authenticate.".to_string()
            }
            AuthError::PersistFailed { .. } => {
                "Failed to save authentication credentials".to_string()
            }
            AuthError::UnknownService { service, .. } => {
                format!("Failed to create {} service", service)
            }
            _ => "OAuth authentication failed".to_string(),
        };
        WorkspaceError::authentication(message).with_cause(err)
    }
}

impl From<ConfigError> for WorkspaceError {
    fn from(err: ConfigError) -> Self {
        WorkspaceError::unexpected("Configuration error").with_cause(err)
    }
}

impl From<std::io::Error> for WorkspaceError {
    fn from(err: std::io::Error) -> Self {
        WorkspaceError::unexpected("I/O error")
            .with_detail("error", Value::String(err.to_string()))
            .with_cause(err)
    }
}

impl From<serde_json::Error> for WorkspaceError {
    fn from(err: serde_json::Error) -> Self {
        WorkspaceError::unexpected("JSON error")
            .with_detail("error", Value::String(err.to_string()))
            .with_cause(err)
    }
}

impl From<validator::ValidationErrors> for WorkspaceError {
    fn from(err: validator::ValidationErrors) -> Self {
        WorkspaceError::invalid_request(format!("Invalid request parameters: {}", err))
            .with_cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_display() {
        let err = AuthError::KeysFileNotFound {
            path: "/path/to/credentials.json".to_string(),
        };
        assert!(err.to_string().contains("/path/to/credentials.json"));
    }

    #[test]
    fn test_auth_error_conversion_keeps_cause() {
        let err: WorkspaceError = AuthError::NoAuthCode.into();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        let source = err.source().expect("cause retained");
        assert_eq!(source.to_string(), "No authorization code provided");
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let err = WorkspaceError::rate_limit("slow down", Duration::from_secs(60));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
        assert_eq!(err.details()["retry_after"], 60);
    }

    #[test]
    fn test_to_json_shape() {
        let err = WorkspaceError::not_found("Requested resource not found.")
            .with_detail("file_id", json!("abc"));
        let value = err.to_json();
        assert_eq!(value["error"]["type"], "ResourceNotFoundError");
        assert_eq!(value["error"]["details"]["file_id"], "abc");
    }

    #[test]
    fn test_clone_shares_cause() {
        let err = WorkspaceError::unexpected("boom").with_cause(AuthError::NoAuthCode);
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::Unexpected);
        let source = copy.source().expect("cause shared");
        assert!(matches!(
            source.downcast_ref::<AuthError>(),
            Some(AuthError::NoAuthCode)
        ));
        assert_eq!(err.to_string(), copy.to_string());
    }
}
