//! Unified error handling for herald services
//!
//! One error type shared by the libraries and the messaging service. HTTP
//! surfaces convert it into the response envelope, the STOMP broker turns the
//! protocol and token variants into `ERROR` frames.

use std::fmt;
use thiserror::Error;

/// Envelope code for a successful response
pub const CODE_SUCCESS: &str = "00000";
/// Generic client-side failure code
pub const CODE_CLIENT_ERROR: &str = "A";
/// Token rejected (invalid, malformed, expired, not yet valid)
pub const CODE_TOKEN_INVALID: &str = "A0230";
/// Username or password mismatch
pub const CODE_BAD_CREDENTIALS: &str = "A0210";
/// Server-side failure code
pub const CODE_SERVER_ERROR: &str = "B0001";

// ============================================================================
// TokenErrorKind
// ============================================================================

/// Why a bearer token was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenErrorKind {
    /// Signature mismatch, wrong issuer, or revoked in the cache
    Invalid,
    /// Not a well-formed compact token
    Malformed,
    /// Current instant is after `exp`
    Expired,
    /// Current instant is before `nbf`
    NotYetValid,
}

impl TokenErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Malformed => "malformed",
            Self::Expired => "expired",
            Self::NotYetValid => "not-yet-valid",
        }
    }
}

impl fmt::Display for TokenErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// HeraldError - Main error type
// ============================================================================

/// Main error type for all herald services
#[derive(Debug, Error)]
pub enum HeraldError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Authentication & Authorization Errors
    // ======================================
    #[error("Token {0}")]
    Token(TokenErrorKind),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid username or password")]
    BadCredentials,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Too many requests")]
    RateLimitExceeded,

    // ======================================
    // Messaging Errors
    // ======================================
    #[error("STOMP protocol error: {0}")]
    StompProtocol(String),

    #[error("Unknown app destination: {0}")]
    UnknownAppDestination(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    // ======================================
    // Database & Cache Errors
    // ======================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Transaction commit failed: {0}")]
    CommitFailed(String),

    // ======================================
    // API & HTTP Errors
    // ======================================
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {resource}")]
    NotFound { resource: String },

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Request handler panicked: {0}")]
    Panic(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using HeraldError
pub type HeraldResult<T> = Result<T, HeraldError>;

impl HeraldError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::BadRequest(_) | Self::Validation(_) | Self::StompProtocol(_) => 400,

            // 401 Unauthorized
            Self::Token(_) | Self::Unauthorized(_) | Self::BadCredentials => 401,

            // 403 Forbidden
            Self::Forbidden(_) => 403,

            // 404 Not Found
            Self::NotFound { .. }
            | Self::SessionNotFound(_)
            | Self::UnknownAppDestination(_) => 404,

            // 429 Too Many Requests
            Self::RateLimitExceeded => 429,

            // 503 Service Unavailable
            Self::ServiceUnavailable(_) | Self::Redis(_) => 503,

            // 500 Internal Server Error
            Self::Configuration(_)
            | Self::InvalidConfig { .. }
            | Self::DeliveryFailed(_)
            | Self::Database(_)
            | Self::Sqlite(_)
            | Self::CommitFailed(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Panic(_)
            | Self::Internal(_)
            | Self::Other(_) => 500,
        }
    }

    /// Code carried in the `code` field of the HTTP envelope
    pub fn envelope_code(&self) -> &'static str {
        match self {
            Self::Token(_) => CODE_TOKEN_INVALID,
            Self::BadCredentials => CODE_BAD_CREDENTIALS,
            _ if self.status_code() >= 500 => CODE_SERVER_ERROR,
            _ => CODE_CLIENT_ERROR,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable(_) | Self::Redis(_) | Self::RateLimitExceeded
        )
    }

    /// True for the token variants that close a STOMP session
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            Self::Token(_) | Self::Unauthorized(_) | Self::BadCredentials
        )
    }
}

// Conversion traits for common error types
impl From<serde_json::Error> for HeraldError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::num::ParseIntError> for HeraldError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Validation(format!("Invalid integer: {}", err))
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::HeraldError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::HeraldError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($msg:expr) => {
        $crate::HeraldError::StompProtocol($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::HeraldError::StompProtocol(format!($fmt, $($arg)*))
    };
}

// ============================================================================
// HeraldError implements HeraldErrorTrait
// ============================================================================

impl HeraldErrorTrait for HeraldError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",

            Self::Token(TokenErrorKind::Invalid) => "AUTH_TOKEN_INVALID",
            Self::Token(TokenErrorKind::Malformed) => "AUTH_TOKEN_MALFORMED",
            Self::Token(TokenErrorKind::Expired) => "AUTH_TOKEN_EXPIRED",
            Self::Token(TokenErrorKind::NotYetValid) => "AUTH_TOKEN_NOT_YET_VALID",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::BadCredentials => "BAD_CREDENTIALS",
            Self::Forbidden(_) => "AUTH_FORBIDDEN",
            Self::RateLimitExceeded => "RATELIMIT_EXCEEDED",

            Self::StompProtocol(_) => "STOMP_PROTOCOL",
            Self::UnknownAppDestination(_) => "BROKER_UNKNOWN_APP_DESTINATION",
            Self::SessionNotFound(_) => "BROKER_SESSION_NOT_FOUND",
            Self::DeliveryFailed(_) => "BROKER_DELIVERY_FAILED",

            Self::Database(_) => "DATABASE_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::CommitFailed(_) => "DB_COMMIT_FAILURE",

            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",

            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Panic(_) => "PANIC",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,

            Self::Token(_) | Self::Unauthorized(_) | Self::BadCredentials | Self::Forbidden(_) => {
                ErrorCategory::Permission
            },

            Self::RateLimitExceeded => ErrorCategory::ResourceExhausted,

            Self::StompProtocol(_) | Self::UnknownAppDestination(_) => ErrorCategory::Protocol,

            Self::SessionNotFound(_) | Self::DeliveryFailed(_) => ErrorCategory::Connection,

            Self::Database(_) | Self::Sqlite(_) | Self::CommitFailed(_) => ErrorCategory::Database,

            Self::Redis(_) | Self::ServiceUnavailable(_) => ErrorCategory::Network,

            Self::BadRequest(_) | Self::Validation(_) => ErrorCategory::Validation,

            Self::NotFound { .. } => ErrorCategory::NotFound,

            Self::Io(_) | Self::Serialization(_) | Self::Panic(_) | Self::Internal(_) => {
                ErrorCategory::Internal
            },

            Self::Other(_) => ErrorCategory::Unknown,
        }
    }
}

// ============================================================================
// Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Database,
    Network,

    // Request layer
    Validation,
    NotFound,
    Permission,
    ResourceExhausted,

    // Messaging layer
    Protocol,
    Connection,

    // System level
    Internal,
    Unknown,
}

/// Common interface for herald error types
pub trait HeraldErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Stable machine-readable code (logs, monitoring)
    fn error_code(&self) -> &'static str;

    /// Error category
    fn category(&self) -> ErrorCategory;

    /// Log level appropriate for this error
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Database | ErrorCategory::Unknown => {
                Level::ERROR
            },
            ErrorCategory::Network | ErrorCategory::Connection | ErrorCategory::Protocol => {
                Level::WARN
            },
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}

// Tests
#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(HeraldError::Token(TokenErrorKind::Expired).status_code(), 401);
        assert_eq!(HeraldError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(HeraldError::RateLimitExceeded.status_code(), 429);
        assert_eq!(HeraldError::Panic("boom".into()).status_code(), 500);
        assert_eq!(
            HeraldError::NotFound {
                resource: "notice".into()
            }
            .status_code(),
            404
        );
    }

    #[test]
    fn test_envelope_codes() {
        assert_eq!(HeraldError::RateLimitExceeded.envelope_code(), "A");
        assert_eq!(
            HeraldError::Token(TokenErrorKind::Invalid).envelope_code(),
            CODE_TOKEN_INVALID
        );
        assert_eq!(HeraldError::BadCredentials.envelope_code(), CODE_BAD_CREDENTIALS);
        assert_eq!(
            HeraldError::Internal("x".into()).envelope_code(),
            CODE_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limit_message() {
        assert_eq!(HeraldError::RateLimitExceeded.to_string(), "Too many requests");
    }

    #[test]
    fn test_token_kind_display() {
        assert_eq!(
            HeraldError::Token(TokenErrorKind::NotYetValid).to_string(),
            "Token not-yet-valid"
        );
        assert_eq!(
            HeraldError::Token(TokenErrorKind::Malformed).error_code(),
            "AUTH_TOKEN_MALFORMED"
        );
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(
            HeraldError::Panic("x".into()).log_level(),
            tracing::Level::ERROR
        );
        assert_eq!(
            HeraldError::StompProtocol("x".into()).log_level(),
            tracing::Level::WARN
        );
        assert!(HeraldError::Token(TokenErrorKind::Expired).is_authentication_failure());
        assert!(!HeraldError::RateLimitExceeded.is_authentication_failure());
    }

    #[test]
    fn test_protocol_macro() {
        let err = protocol_error!("bad frame at {}", 3);
        assert!(matches!(err, HeraldError::StompProtocol(ref m) if m == "bad frame at 3"));
    }
}
