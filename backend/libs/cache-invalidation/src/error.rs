//! Error types for cache invalidation operations

use thiserror::Error;

/// Cache invalidation errors
#[derive(Error, Debug)]
pub enum InvalidationError {
    /// Redis connection or operation error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Message serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cache key did not have the `<type>:<id>` shape
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    /// Every retry attempt failed
    #[error("Cache invalidation failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}
