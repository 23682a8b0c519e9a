//! Error types for database sessions
//!
//! Covers settings parsing, pool management, session lifecycle and
//! session event dispatch.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while reading database settings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {key}")]
    MissingRequired { key: String },

    #[error("Invalid value for setting '{key}': '{value}'. Expected: {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("Engine '{name}' is configured more than once")]
    DuplicateEngine { name: String },

    #[error("Invalid engine name '{name}': {reason}")]
    InvalidEngineName { name: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: &str, expected: &str) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Database connection pool error types
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Connection acquisition failed: {0}")]
    AcquisitionFailed(#[from] sqlx::Error),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Connection timeout after {timeout}s")]
    ConnectionTimeout { timeout: u64 },

    #[error("Health check failed: {reason}")]
    HealthCheckFailed { reason: String },
}

/// Errors raised by session event listeners
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventError {
    #[error("Event handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event propagation stopped: {0}")]
    PropagationStopped(String),
}

/// Errors for engine lookup and session lifecycle
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("No database engine registered under name '{name}'")]
    UnknownEngine { name: String },

    #[error("Failed to connect engine '{name}': {source}")]
    Connect {
        name: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Session {id} on engine '{name}' is closed")]
    SessionClosed { id: u64, name: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Session event failed: {0}")]
    Event(#[from] EventError),

    #[error("Database sessions are not installed on this application")]
    NotInstalled,
}

impl SessionError {
    /// Stable machine readable code used in error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::Configuration(_) => "DATABASE_CONFIG_ERROR",
            SessionError::UnknownEngine { .. } => "UNKNOWN_ENGINE",
            SessionError::Connect { .. } => "DATABASE_CONNECT_ERROR",
            SessionError::Pool(_) => "DATABASE_POOL_ERROR",
            SessionError::Transaction(_) => "TRANSACTION_ERROR",
            SessionError::SessionClosed { .. } => "SESSION_CLOSED",
            SessionError::Database(_) => "DATABASE_ERROR",
            SessionError::Event(_) => "SESSION_EVENT_ERROR",
            SessionError::NotInstalled => "SESSIONS_NOT_INSTALLED",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SessionError::Pool(PoolError::ConnectionTimeout { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_hint(&self) -> Option<&'static str> {
        match self {
            SessionError::UnknownEngine { .. } => Some("Check the configured engine names"),
            SessionError::NotInstalled => Some("Add the database session layer to the router"),
            SessionError::Pool(PoolError::ConnectionTimeout { .. }) => Some("Retry the request"),
            _ => None,
        }
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
                "hint": self.error_hint()
            }
        });

        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("database.max_connections", "lots", "an unsigned integer");
        assert_eq!(
            err.to_string(),
            "Invalid value for setting 'database.max_connections': 'lots'. Expected: an unsigned integer"
        );

        let err = ConfigError::MissingRequired { key: "database.a.url".to_string() };
        assert!(err.to_string().contains("database.a.url"));
    }

    #[test]
    fn test_pool_error_types() {
        let timeout_error = PoolError::ConnectionTimeout { timeout: 30 };
        let pool_closed_error = PoolError::PoolClosed;

        assert!(timeout_error.to_string().contains("timeout"));
        assert!(pool_closed_error.to_string().contains("closed"));
    }

    #[test]
    fn test_session_error_codes() {
        let err = SessionError::UnknownEngine { name: "reports".to_string() };
        assert_eq!(err.error_code(), "UNKNOWN_ENGINE");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("reports"));

        let err: SessionError = PoolError::ConnectionTimeout { timeout: 5 }.into();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.error_hint(), Some("Retry the request"));
    }

    #[test]
    fn test_event_error_conversion() {
        let err: SessionError = EventError::HandlerFailed("audit hook".to_string()).into();
        assert!(matches!(err, SessionError::Event(_)));
        assert_eq!(err.error_code(), "SESSION_EVENT_ERROR");
    }

    #[test]
    fn test_error_response_status() {
        let response = SessionError::NotInstalled.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
