// for error definitions
use redis;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimiterError {
    /// Returned when a guarded operation is rejected because its bucket is empty
    #[error("Rate limit exceeded for key: {key}")]
    LimitExceeded { key: String, retry_after: Duration },

    /// Errors related to the storage backend
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected or internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RateLimiterError {
    /// Builds the rejection raised when `key` has no token left
    pub fn limit_exceeded(key: impl Into<String>, retry_after: Duration) -> Self {
        RateLimiterError::LimitExceeded {
            key: key.into(),
            retry_after,
        }
    }

    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, RateLimiterError::LimitExceeded { .. })
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Redis connection errors
    #[error("Redis connection error: {0}")]
    RedisConnection(String),

    // Redis authentication errors
    #[error("Redis authentication error: {0}")]
    RedisAuth(String),

    /// Redis command errors
    #[error("Redis command error: {0}")]
    RedisCommand(String),

    /// Data serialization/deserialization errors
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// The row lock could not be acquired within the configured wait
    #[error("Timed out after {waited:?} waiting for the lock on bucket {bucket_id}")]
    LockTimeout { bucket_id: i64, waited: Duration },

    /// The bucket table reached its configured row limit
    #[error("Bucket table is full ({0} rows)")]
    TableFull(usize),

    /// The lock lease expired before the row was written back
    #[error("Lock on bucket {bucket_id} was lost before commit")]
    LockLost { bucket_id: i64 },
}

// Implement conversions from redis::RedisError to StorageError
impl From<redis::RedisError> for RateLimiterError {
    fn from(err: redis::RedisError) -> Self {
        match err.kind() {
            redis::ErrorKind::AuthenticationFailed => {
                // authentication errors
                RateLimiterError::Storage(StorageError::RedisAuth(err.to_string()))
            }
            redis::ErrorKind::IoError | redis::ErrorKind::ClientError => {
                // Connection-related errors
                RateLimiterError::Storage(StorageError::RedisConnection(err.to_string()))
            }
            _ => {
                // Command/operation related errors
                RateLimiterError::Storage(StorageError::RedisCommand(err.to_string()))
            }
        }
    }
}

// implement conversions from serde_json::Error to RateLimiterError
impl From<serde_json::Error> for RateLimiterError {
    fn from(err: serde_json::Error) -> Self {
        RateLimiterError::Storage(StorageError::Serialization(err.to_string()))
    }
}

impl From<StorageError> for RateLimiterError {
    fn from(err: StorageError) -> Self {
        RateLimiterError::Storage(err)
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, RateLimiterError>;
