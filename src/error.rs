//! Error types and JSON error responses
//!
//! - [`SupervisorError`]: failures of worker lifecycle calls
//! - [`RouterError`]: failures of router lifecycle calls
//! - [`AppError`]: everything the facade and control API can report
//! - [`ProxyErrorCode`]: error bodies the router returns to HTTP clients

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Boxed error used by streamed response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body produced by the router
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Errors returned by the process supervisor.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The worker executable could not be resolved; start refused.
    #[error("worker executable '{command}' is not available")]
    WorkerUnavailable { command: String },

    /// A worker slot already exists for the profile.
    #[error("profile {0} is already running")]
    AlreadyRunning(i64),

    /// No running worker exists for the profile.
    #[error("profile {0} is not running")]
    NotRunning(i64),

    /// Storage has no profile with this id.
    #[error("profile {0} not found")]
    ProfileNotFound(i64),

    /// The scratch config could not be written; nothing was registered.
    #[error("failed to write worker config: {0}")]
    ConfigWriteFailure(#[source] std::io::Error),

    /// The worker process could not be created; scratch config removed.
    #[error("failed to spawn worker: {0}")]
    SpawnFailure(#[source] std::io::Error),

    /// Worker did not exit within its bound and was force-terminated.
    #[error("worker for profile {profile_id} did not exit within {timeout:?}")]
    ShutdownTimeout { profile_id: i64, timeout: Duration },

    #[error("storage error: {0}")]
    Storage(String),
}

impl SupervisorError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SupervisorError::WorkerUnavailable { .. } => "worker_unavailable",
            SupervisorError::AlreadyRunning(_) => "already_running",
            SupervisorError::NotRunning(_) => "not_running",
            SupervisorError::ProfileNotFound(_) => "profile_not_found",
            SupervisorError::ConfigWriteFailure(_) => "config_write_failure",
            SupervisorError::SpawnFailure(_) => "spawn_failure",
            SupervisorError::ShutdownTimeout { .. } => "shutdown_timeout",
            SupervisorError::Storage(_) => "storage",
        }
    }
}

/// Errors returned by the host router.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RouterError {
    #[error("host router not running")]
    RouterNotRunning,

    #[error("invalid listen address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// Graceful shutdown exceeded its bound; connections were aborted.
    #[error("host router did not shut down within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("storage error: {0}")]
    Storage(String),
}

impl RouterError {
    pub fn as_label(&self) -> &'static str {
        match self {
            RouterError::RouterNotRunning => "router_not_running",
            RouterError::InvalidAddress { .. } => "invalid_address",
            RouterError::ShutdownTimeout(_) => "shutdown_timeout",
            RouterError::Storage(_) => "storage",
        }
    }
}

/// Errors surfaced by the application facade.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("profile {0} not found")]
    ProfileNotFound(i64),

    /// Mutation refused because the profile has a live worker.
    #[error("profile {0} is running; stop it first")]
    ProfileRunning(i64),

    #[error("host mapping '{0}' not found")]
    MappingNotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl AppError {
    pub fn as_label(&self) -> &'static str {
        match self {
            AppError::Supervisor(e) => e.as_label(),
            AppError::Router(e) => e.as_label(),
            AppError::ProfileNotFound(_) => "profile_not_found",
            AppError::ProfileRunning(_) => "profile_running",
            AppError::MappingNotFound(_) => "mapping_not_found",
            AppError::Invalid(_) => "invalid",
            AppError::Storage(_) => "storage",
        }
    }

    /// HTTP status used by the control API
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Supervisor(SupervisorError::WorkerUnavailable { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Supervisor(SupervisorError::AlreadyRunning(_))
            | AppError::Supervisor(SupervisorError::NotRunning(_))
            | AppError::Router(RouterError::RouterNotRunning)
            | AppError::ProfileRunning(_) => StatusCode::CONFLICT,
            AppError::Supervisor(SupervisorError::ProfileNotFound(_))
            | AppError::ProfileNotFound(_)
            | AppError::MappingNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Router(RouterError::InvalidAddress { .. }) | AppError::Invalid(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Flatten an anyhow chain into a storage error message
pub(crate) fn storage_message(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

/// Error codes for router responses
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Upstream did not respond in time
    RequestTimeout,
    /// Failed to connect to upstream
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(
        Full::new(Bytes::from(body))
            .map_err(|never| match never {})
            .boxed_unsync(),
    );
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "x-proxy-error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "upstream refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"upstream refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(SupervisorError::AlreadyRunning(1).as_label(), "already_running");
        assert_eq!(RouterError::RouterNotRunning.as_label(), "router_not_running");
        let wrapped = AppError::from(SupervisorError::NotRunning(4));
        assert_eq!(wrapped.as_label(), "not_running");
        assert_eq!(wrapped.to_string(), "profile 4 is not running");
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::from(SupervisorError::WorkerUnavailable {
                command: "gost".into()
            })
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            AppError::from(SupervisorError::AlreadyRunning(1)).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(AppError::ProfileRunning(1).status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::ProfileNotFound(9).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::from(RouterError::InvalidAddress {
                addr: "x".into(),
                reason: "bad".into()
            })
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Storage("disk".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
