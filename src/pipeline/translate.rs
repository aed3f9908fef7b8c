//! Translation of remote-call failures into [`WorkspaceError`]
//!
//! Service handles report non-success HTTP responses as [`ApiError`]. The
//! pipeline wraps every thunk with [`with_error_handling`], which leaves
//! `WorkspaceError`s untouched, maps `ApiError`s (and status-bearing
//! `reqwest` errors) by status code, and records anything else as
//! `Unexpected` with the original error kept as the cause.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::error;

use crate::error::{Result, WorkspaceError};

/// Wait suggested when the API does not send `Retry-After`
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Reasons Google reports on 403 responses that are really quota failures
const QUOTA_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "dailyLimitExceeded",
];

/// A non-success response from a Workspace REST API
#[derive(Error, Debug, Clone)]
#[error("{service} API returned {status}: {message}")]
pub struct ApiError {
    pub service: String,
    pub status: u16,
    /// Google's canonical status, e.g. `PERMISSION_DENIED`
    pub status_name: Option<String>,
    /// First `errors[].reason`, e.g. `rateLimitExceeded`
    pub reason: Option<String>,
    pub message: String,
    pub retry_after: Option<Duration>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

impl ApiError {
    /// Build from a status code, optional `Retry-After` and raw body
    pub fn from_parts(
        service: &str,
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
    ) -> Self {
        let (message, status_name, reason) = match serde_json::from_str::<ErrorEnvelope>(body) {
            Ok(envelope) => (
                envelope.error.message,
                envelope.error.status,
                envelope.error.errors.into_iter().find_map(|e| e.reason),
            ),
            Err(_) => (body.trim().to_string(), None, None),
        };

        Self {
            service: service.to_string(),
            status,
            status_name,
            reason,
            message,
            retry_after,
        }
    }

    /// Read status, headers and body off a failed response
    pub async fn from_response(service: &str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Self::from_parts(service, status, retry_after, &body)
    }

    fn is_quota_failure(&self) -> bool {
        self.status_name.as_deref() == Some("RESOURCE_EXHAUSTED")
            || self
                .reason
                .as_deref()
                .is_some_and(|r| QUOTA_REASONS.contains(&r))
    }
}

/// Map a recognised API failure onto the domain taxonomy
pub fn translate_api_error(err: ApiError) -> WorkspaceError {
    let translated = match err.status {
        401 => WorkspaceError::authentication(
            "Authentication failed. Please check your credentials.",
        ),
        _ if err.status_name.as_deref() == Some("UNAUTHENTICATED") => {
            WorkspaceError::authentication("Authentication failed. Please check your credentials.")
        }
        429 => WorkspaceError::rate_limit(
            "API rate limit exceeded. Please try again later.",
            err.retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        ),
        403 if err.is_quota_failure() => WorkspaceError::rate_limit(
            "API rate limit exceeded. Please try again later.",
            err.retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
        ),
        403 => WorkspaceError::permission("Permission denied. Check your account permissions."),
        404 => WorkspaceError::not_found("Requested resource not found."),
        400 | 422 => WorkspaceError::invalid_request("Invalid request parameters."),
        _ => {
            error!(service = %err.service, status = err.status, "Unhandled Google API error: {}", err.message);
            WorkspaceError::unexpected("An unexpected error occurred.")
                .with_detail("original_error", Value::String(err.to_string()))
        }
    };

    let mut translated = translated
        .with_detail("service", json!(err.service))
        .with_detail("status", json!(err.status));
    if let Some(reason) = &err.reason {
        translated = translated.with_detail("reason", json!(reason));
    }
    if !err.message.is_empty() {
        translated = translated.with_detail("api_message", json!(err.message));
    }
    translated.with_cause(err)
}

/// Translate any failure raised by a remote call.
///
/// `operation` names the failing call in logs and messages.
pub fn translate(operation: &str, err: anyhow::Error) -> WorkspaceError {
    let err = match err.downcast::<WorkspaceError>() {
        Ok(domain) => return domain,
        Err(other) => other,
    };
    let err = match err.downcast::<ApiError>() {
        Ok(api) => return translate_api_error(api),
        Err(other) => other,
    };
    if let Some(status) = err
        .downcast_ref::<reqwest::Error>()
        .and_then(|e| e.status())
    {
        let api = ApiError {
            service: operation.to_string(),
            status: status.as_u16(),
            status_name: None,
            reason: None,
            message: err.to_string(),
            retry_after: None,
        };
        return translate_api_error(api).with_cause(err);
    }

    error!(operation, "Unexpected error in {}: {:#}", operation, err);
    WorkspaceError::unexpected(format!("Unexpected error in {}", operation))
        .with_detail("error", Value::String(err.to_string()))
        .with_cause(err)
}

/// Await `call`, translating its failure exactly once
pub async fn with_error_handling<T, Fut>(operation: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    call.await.map_err(|err| translate(operation, err))
}
