use thiserror::Error;

/// Job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stream entry without a decodable job
    #[error("Malformed queue entry {entry_id}: {reason}")]
    MalformedEntry { entry_id: String, reason: String },

    /// Delivery is not (or no longer) held by this queue
    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}
