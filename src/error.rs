//! Error types for cache and queue operations.

use std::fmt;

/// Result type for cache and queue operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared by every backend.
///
/// Both backends report failures through the same variants so callers can
/// switch backends without touching their error handling.
#[derive(Debug, Clone)]
pub enum Error {
    /// Key absent or expired on a read (`get`, `hash_get`).
    ///
    /// Recoverable: the caller decides the fallback.
    NotFound(String),

    /// Key absent or expired on a mutation that requires an existing entry
    /// (`increase`, `decrease`, `expire`).
    NotExist(String),

    /// The value handed to `set` has no string form.
    ///
    /// This is a caller bug and is surfaced immediately.
    EncodingError(String),

    /// Counter operation on a value that does not parse as an integer.
    TypeError(String),

    /// Operation is not available on this backend.
    ///
    /// Returned by `lock` on the in-process backend: single-process
    /// semantics make a distributed lock meaningless.
    UnsupportedOperation(String),

    /// Distributed lock is already held by someone else.
    ///
    /// **Recovery:** retry with backoff; the policy belongs to the caller.
    LockContention(String),

    /// Lock was released or expired before `refresh`/`release` ran.
    LockNotHeld(String),

    /// The stream was closed by `shutdown` and no longer accepts messages.
    QueueClosed(String),

    /// Message payload could not be converted to or from its stored form.
    SerializationError(String),

    /// Backend storage error (Redis connection lost, protocol error, etc).
    ///
    /// **Recovery:** retry the operation or fall back.
    BackendError(String),

    /// Configuration error during backend construction.
    ConfigError(String),

    /// Generic error with custom message.
    ///
    /// Consumers typically return this to request redelivery.
    Other(String),
}

impl Error {
    /// True for the "key is not there" family (`NotFound` and `NotExist`).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::NotExist(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "Not found: {}", key),
            Error::NotExist(key) => write!(f, "{} not exist", key),
            Error::EncodingError(msg) => write!(f, "Encoding error: {}", msg),
            Error::TypeError(msg) => write!(f, "Type error: {}", msg),
            Error::UnsupportedOperation(msg) => write!(f, "Unsupported operation: {}", msg),
            Error::LockContention(key) => write!(f, "Lock not obtained: {}", key),
            Error::LockNotHeld(key) => write!(f, "Lock not held: {}", key),
            Error::QueueClosed(stream) => write!(f, "Queue closed: {}", stream),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::redis::RedisError> for Error {
    fn from(e: deadpool_redis::redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
