use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Main error type for the meshgate runtime
#[derive(Debug)]
pub enum MeshError {
    /// Configuration or CLI argument errors
    Config(String),

    /// The selector found no node surviving the filter chain
    NoNodeAvailable(String),

    /// An invoke deadline elapsed before a reply arrived
    Timeout { method: String, after: Duration },

    /// The owning gate no longer holds a live connection for the session
    SessionClosed(String),

    /// `bind` was called on a session that already carries a user id
    AlreadyBound(String),

    /// The owner rejected a push built from an outdated snapshot
    StaleSession { connection_id: String, version: u64 },

    /// An exported session mapping could not be turned back into a session
    InvalidSession(String),

    /// Registry lookups and node id resolution
    Registry(String),

    /// Transport layer errors, including remote faults
    Transport(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// System I/O errors
    Io(std::io::Error),

    /// Admin API errors
    Api(String),
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MeshError::NoNodeAvailable(service) => {
                write!(f, "No node available for service: {}", service)
            }
            MeshError::Timeout { method, after } => write!(
                f,
                "Call to {} timed out after {}ms",
                method,
                after.as_millis()
            ),
            MeshError::SessionClosed(id) => write!(f, "Session closed: {}", id),
            MeshError::AlreadyBound(user) => write!(f, "Session already bound to: {}", user),
            MeshError::StaleSession {
                connection_id,
                version,
            } => write!(
                f,
                "Stale session {} at version {}",
                connection_id, version
            ),
            MeshError::InvalidSession(msg) => write!(f, "Invalid session: {}", msg),
            MeshError::Registry(msg) => write!(f, "Registry error: {}", msg),
            MeshError::Transport(msg) => write!(f, "Transport error: {}", msg),
            MeshError::Serialization(err) => write!(f, "Serialization error: {}", err),
            MeshError::Io(err) => write!(f, "I/O error: {}", err),
            MeshError::Api(msg) => write!(f, "API error: {}", msg),
        }
    }
}

impl std::error::Error for MeshError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MeshError::Io(err) => Some(err),
            MeshError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, MeshError>;

impl MeshError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            MeshError::Config(_) => StatusCode::BAD_REQUEST,
            MeshError::NoNodeAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            MeshError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            MeshError::SessionClosed(_) => StatusCode::GONE,
            MeshError::AlreadyBound(_) => StatusCode::CONFLICT,
            MeshError::StaleSession { .. } => StatusCode::CONFLICT,
            MeshError::InvalidSession(_) => StatusCode::BAD_REQUEST,
            MeshError::Registry(_) => StatusCode::NOT_FOUND,
            MeshError::Transport(_) => StatusCode::BAD_GATEWAY,
            MeshError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MeshError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            MeshError::Api(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            MeshError::Config(_) => "configuration_error",
            MeshError::NoNodeAvailable(_) => "no_node_available",
            MeshError::Timeout { .. } => "timeout",
            MeshError::SessionClosed(_) => "session_closed",
            MeshError::AlreadyBound(_) => "already_bound",
            MeshError::StaleSession { .. } => "stale_session",
            MeshError::InvalidSession(_) => "invalid_session",
            MeshError::Registry(_) => "registry_error",
            MeshError::Transport(_) => "transport_error",
            MeshError::Serialization(_) => "serialization_error",
            MeshError::Io(_) => "io_error",
            MeshError::Api(_) => "api_error",
        }
    }
}

// Axum IntoResponse implementation for admin API error responses
impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_response = json!({
            "error": {
                "code": status_code.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status_code, Json(error_response)).into_response()
    }
}

// Conversions from common error types
impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io(err)
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err)
    }
}

impl From<redis::RedisError> for MeshError {
    fn from(err: redis::RedisError) -> Self {
        MeshError::Transport(format!("status store: {}", err))
    }
}

impl From<url::ParseError> for MeshError {
    fn from(err: url::ParseError) -> Self {
        MeshError::Config(format!("invalid url: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::MeshError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MeshError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::MeshError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MeshError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! registry_error {
    ($msg:expr) => {
        $crate::error::MeshError::Registry($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::MeshError::Registry(format!($fmt, $($arg)*))
    };
}
