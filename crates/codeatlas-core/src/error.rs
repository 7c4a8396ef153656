use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Internal error codes carried by [`CodeAtlasError`].
///
/// Resilience components key automated decisions (retryability, circuit
/// tripping, fallback selection) on these codes rather than on error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NetworkError,
    ExternalServiceError,
    RateLimited,
    BreakerOpen,
    FileNotFound,
    PermissionDenied,
    ValidationError,
    ConfigError,
    PlatformError,
    DatabaseError,
    ParseError,
    SerializationError,
    IoError,
    InvalidOperation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ExternalServiceError => "EXTERNAL_SERVICE_ERROR",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::BreakerOpen => "BREAKER_OPEN",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::ConfigError => "CONFIG_ERROR",
            ErrorCode::PlatformError => "PLATFORM_ERROR",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::InvalidOperation => "INVALID_OPERATION",
        };
        write!(f, "{s}")
    }
}

#[derive(Error, Debug)]
pub enum CodeAtlasError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {message}")]
    Network {
        message: String,
        status: Option<u16>,
    },

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Circuit breaker open: {0}")]
    BreakerOpen(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl CodeAtlasError {
    /// The explicit internal error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CodeAtlasError::Io(_) => ErrorCode::IoError,
            CodeAtlasError::Serialization(_) => ErrorCode::SerializationError,
            CodeAtlasError::Network { .. } => ErrorCode::NetworkError,
            CodeAtlasError::ExternalService(_) => ErrorCode::ExternalServiceError,
            CodeAtlasError::RateLimited(_) => ErrorCode::RateLimited,
            CodeAtlasError::BreakerOpen(_) => ErrorCode::BreakerOpen,
            CodeAtlasError::FileNotFound(_) => ErrorCode::FileNotFound,
            CodeAtlasError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CodeAtlasError::Validation(_) => ErrorCode::ValidationError,
            CodeAtlasError::Config(_) => ErrorCode::ConfigError,
            CodeAtlasError::Platform(_) => ErrorCode::PlatformError,
            CodeAtlasError::Database(_) => ErrorCode::DatabaseError,
            CodeAtlasError::Parse(_) => ErrorCode::ParseError,
            CodeAtlasError::InvalidOperation(_) => ErrorCode::InvalidOperation,
        }
    }

    /// Numeric status code, if the error carries one (HTTP status for
    /// network errors, OS errno for IO errors).
    pub fn status_code(&self) -> Option<i32> {
        match self {
            CodeAtlasError::Network { status, .. } => status.map(i32::from),
            CodeAtlasError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodeAtlasError>;
