/// Unified error handling for the data-access layer
///
/// Storage failures (`PoolExhausted`, `QueryTimeout`, `Query`) are surfaced to
/// callers unchanged. Cache and replica-health failures never reach this type:
/// they are absorbed by the cache store and the router respectively.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for data-access operations
#[derive(Debug, Error)]
pub enum DataError {
    /// Every connection of a pool stayed busy past the queue timeout
    #[error("Connection pool exhausted for target {target} after waiting {waited:?}")]
    PoolExhausted { target: String, waited: Duration },

    /// An operation exceeded its time budget
    #[error("Operation timed out on target {target}: {operation} exceeded {limit:?}")]
    QueryTimeout {
        target: String,
        operation: String,
        limit: Duration,
    },

    /// The backend rejected the operation
    #[error("Query error: {message}")]
    Query { message: String },

    /// A connection could not be opened or broke mid-use
    #[error("Connection error on target {target}: {message}")]
    Connection { target: String, message: String },

    /// The pool was closed by `close()`
    #[error("Connection pool for target {target} is closed")]
    Closed { target: String },

    /// A loaded value could not be encoded for the cache
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for data-access operations
pub type DataResult<T> = Result<T, DataError>;

/// Convenience methods for creating specific error types
impl DataError {
    /// Create a query error
    pub fn query<S: Into<String>>(message: S) -> Self {
        DataError::Query {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<T: Into<String>, S: Into<String>>(target: T, message: S) -> Self {
        DataError::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<T: Into<String>, O: Into<String>>(target: T, operation: O, limit: Duration) -> Self {
        DataError::QueryTimeout {
            target: target.into(),
            operation: operation.into(),
            limit,
        }
    }

    /// Create a pool exhaustion error
    pub fn pool_exhausted<T: Into<String>>(target: T, waited: Duration) -> Self {
        DataError::PoolExhausted {
            target: target.into(),
            waited,
        }
    }

    /// Create a closed-pool error
    pub fn closed<T: Into<String>>(target: T) -> Self {
        DataError::Closed {
            target: target.into(),
        }
    }

    /// Check if the caller may retry the operation with backoff.
    ///
    /// A retried `QueryTimeout` on a write may observe a partially applied
    /// first attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataError::PoolExhausted { .. }
                | DataError::QueryTimeout { .. }
                | DataError::Connection { .. }
        )
    }

    /// Response class an HTTP collaborator should map this error to
    pub fn status_class(&self) -> StatusClass {
        match self {
            DataError::PoolExhausted { .. }
            | DataError::QueryTimeout { .. }
            | DataError::Connection { .. }
            | DataError::Closed { .. } => StatusClass::ServiceUnavailable,
            DataError::Query { .. } | DataError::Serialization(_) | DataError::Config(_) => {
                StatusClass::Internal
            }
        }
    }
}

/// Response classes for the HTTP boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// Temporary condition, the request may be retried (503)
    ServiceUnavailable,
    /// The request cannot succeed without correction (500)
    Internal,
}

impl StatusClass {
    /// HTTP status code for this class
    pub fn code(&self) -> u16 {
        match self {
            StatusClass::ServiceUnavailable => 503,
            StatusClass::Internal => 500,
        }
    }
}

impl fmt::Display for StatusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusClass::ServiceUnavailable => write!(f, "503 Service Unavailable"),
            StatusClass::Internal => write!(f, "500 Internal Server Error"),
        }
    }
}
