//! Error types for Gatekeeper.
//!
//! All errors are explicitly typed using thiserror. No panics in production code.
//! Every variant maps onto one of six [`ErrorKind`]s which the HTTP layer turns
//! into status codes.

use serde::Serialize;
use thiserror::Error;

/// Central error type for all Gatekeeper operations.
#[derive(Debug, Error)]
pub enum GatekeeperError {
    /// Referenced user, role, permission or template does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input or a guard policy rejection.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Uniqueness violation on a name or email.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Token missing, malformed, expired or badly signed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated, but the resolved roles/permissions are insufficient.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Stored template failed to render.
    #[error("Template error: {0}")]
    Template(String),

    /// Token signing failure.
    #[error("Token error: {0}")]
    Token(String),

    /// Password hashing failure.
    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    /// Configuration error (missing env vars, invalid values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal state error (missing seed data, invalid state transitions).
    #[error("Internal state error: {0}")]
    InternalState(String),

    /// Regex pattern compilation error.
    #[error("Regex pattern error: {0}")]
    RegexPattern(#[from] regex::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    Unauthorized,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::Internal => "internal",
        }
    }
}

impl GatekeeperError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Database(_)
            | Self::Template(_)
            | Self::Token(_)
            | Self::PasswordHash(_)
            | Self::Config(_)
            | Self::InternalState(_)
            | Self::RegexPattern(_)
            | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Log error with full context using tracing
    ///
    /// Client-correctable errors are logged at debug level. Storage and
    /// internal-state failures are logged at error level, other internal
    /// failures at warn, both with the underlying detail.
    pub fn log_with_context(&self, context: &ErrorContext) {
        match self.kind() {
            ErrorKind::Internal if self.is_critical() => {
                tracing::error!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Critical error occurred"
                );
            }
            ErrorKind::Internal => {
                tracing::warn!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Internal error occurred"
                );
            }
            ErrorKind::Unauthorized | ErrorKind::Forbidden => {
                tracing::warn!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Access denied"
                );
            }
            ErrorKind::NotFound | ErrorKind::Validation | ErrorKind::Conflict => {
                tracing::debug!(
                    error = %self,
                    request_id = %context.request_id,
                    user_id = ?context.user_id,
                    operation = %context.operation,
                    "Request rejected"
                );
            }
        }
    }

    /// Check if this error is critical and requires alerting
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Database(_) | Self::InternalState(_))
    }

    /// Get user-friendly error message (hides internal details)
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(msg)
            | Self::Validation(msg)
            | Self::Conflict(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg) => msg.clone(),
            Self::Database(_) => "Database service temporarily unavailable".to_string(),
            Self::Template(_) => "Template rendering failed".to_string(),
            Self::Config(_) => "Service configuration error".to_string(),
            Self::Token(_)
            | Self::PasswordHash(_)
            | Self::InternalState(_)
            | Self::RegexPattern(_)
            | Self::Json(_) => "Internal service error".to_string(),
        }
    }

    /// Translate an sqlx error, turning unique-constraint violations into
    /// [`GatekeeperError::Conflict`].
    pub fn from_sqlx(err: sqlx::Error, context: &str, conflict: impl FnOnce() -> String) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::Conflict(conflict());
            }
        }
        Self::Database(format!("{}: {}", context, err))
    }
}

/// Context information for error logging
///
/// Provides structured context for debugging and monitoring.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Unique request identifier for correlation
    pub request_id: String,
    /// Acting user ID if available
    pub user_id: Option<i64>,
    /// Operation being performed
    pub operation: String,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: None,
            operation: operation.into(),
        }
    }

    /// Set user ID
    pub fn with_user_id(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// Result type alias for Gatekeeper operations.
pub type Result<T> = std::result::Result<T, GatekeeperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_validation() {
        let err = GatekeeperError::Validation("role not found: premium".to_string());
        assert_eq!(err.to_string(), "Validation error: role not found: premium");
    }

    #[test]
    fn error_display_config() {
        let err = GatekeeperError::Config("JWT_SECRET not set".to_string());
        assert_eq!(err.to_string(), "Configuration error: JWT_SECRET not set");
    }

    #[test]
    fn error_kinds() {
        assert_eq!(
            GatekeeperError::NotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GatekeeperError::Validation("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            GatekeeperError::Conflict("x".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            GatekeeperError::Unauthorized("x".into()).kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            GatekeeperError::Forbidden("x".into()).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            GatekeeperError::Database("x".into()).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            GatekeeperError::Template("x".into()).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn error_is_critical() {
        assert!(GatekeeperError::Database("test".to_string()).is_critical());
        assert!(GatekeeperError::InternalState("test".to_string()).is_critical());
        assert!(!GatekeeperError::Validation("test".to_string()).is_critical());
        assert!(!GatekeeperError::Config("test".to_string()).is_critical());
    }

    #[test]
    fn error_user_message_hides_details() {
        let err = GatekeeperError::Database("SELECT * FROM secret_table".to_string());
        assert_eq!(
            err.user_message(),
            "Database service temporarily unavailable"
        );
        assert!(!err.user_message().contains("secret_table"));

        let err = GatekeeperError::InternalState("default role missing".to_string());
        assert_eq!(err.user_message(), "Internal service error");
    }

    #[test]
    fn error_user_message_keeps_validation_detail() {
        let err = GatekeeperError::Validation("cannot remove admin role from yourself".into());
        assert_eq!(err.user_message(), "cannot remove admin role from yourself");
    }

    #[test]
    fn error_context_builder() {
        let ctx = ErrorContext::new("test_operation").with_user_id(12345);

        assert_eq!(ctx.operation, "test_operation");
        assert_eq!(ctx.user_id, Some(12345));
        assert!(uuid::Uuid::parse_str(&ctx.request_id).is_ok());
    }

    #[test]
    fn error_context_generates_request_id() {
        let ctx1 = ErrorContext::new("op1");
        let ctx2 = ErrorContext::new("op2");

        // Request IDs should be unique
        assert_ne!(ctx1.request_id, ctx2.request_id);
        assert!(!ctx1.request_id.is_empty());
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn log_output(err: &GatekeeperError) -> String {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            err.log_with_context(&ErrorContext::new("log_level_test"));
        });

        let bytes = logs.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn critical_errors_log_at_error_level() {
        let output = log_output(&GatekeeperError::Database("pool closed".to_string()));
        assert!(output.contains("ERROR"));
        assert!(output.contains("Critical error occurred"));
    }

    #[test]
    fn non_critical_internal_errors_log_at_warn_level() {
        let output = log_output(&GatekeeperError::Template("bad".to_string()));
        assert!(output.contains("WARN"));
        assert!(!output.contains("ERROR"));
        assert!(output.contains("Internal error occurred"));
    }
}
