//! Cache invalidation for bulk writes
//!
//! Single-record reads go through a cache-aside path keyed `user:{id}`. Any
//! writer that changes rows behind that cache must drop the matching keys
//! after its transaction commits, otherwise readers keep serving stale rows
//! until the TTL expires.
//!
//! ```text
//! bulk worker:
//!   1. COMMIT bulk update in PostgreSQL
//!   2. DEL user:7 user:8 ...            (with retry/backoff)
//!   3. PUBLISH cache:invalidate {...}   (optional, for in-process caches)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cache_invalidation::{CacheInvalidator, EntityType, RedisCacheInvalidator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = redis::Client::open("redis://localhost:6379")?;
//!     let manager = redis::aio::ConnectionManager::new(client).await?;
//!
//!     let invalidator =
//!         RedisCacheInvalidator::new(manager, EntityType::User, "user-ops-worker".to_string());
//!
//!     invalidator.invalidate("7").await?;
//!     invalidator
//!         .invalidate_batch(&["8".to_string(), "9".to_string()])
//!         .await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

mod error;
mod helpers;

pub use error::InvalidationError;
pub use helpers::{build_cache_key, parse_cache_key};

type Result<T> = std::result::Result<T, InvalidationError>;

/// Keys deleted per DEL command
const DEL_BATCH_SIZE: usize = 1000;

/// Supported entity types for cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EntityType {
    User,
    Custom(String),
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityType::User => write!(f, "user"),
            EntityType::Custom(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match s {
            "user" => EntityType::User,
            custom => EntityType::Custom(custom.to_string()),
        }
    }
}

/// Invalidation action
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum InvalidationAction {
    Delete, // Delete single entity
    Batch,  // Batch of entities
}

/// Cache invalidation message broadcast to other instances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub message_id: String,
    pub entity_type: EntityType,
    pub entity_ids: Vec<String>,
    pub action: InvalidationAction,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source_service: String,
}

impl InvalidationMessage {
    /// Create new delete message
    pub fn delete(entity_type: EntityType, entity_id: String, source_service: String) -> Self {
        Self::build(
            entity_type,
            vec![entity_id],
            InvalidationAction::Delete,
            source_service,
        )
    }

    /// Create new batch message
    pub fn batch(entity_type: EntityType, entity_ids: Vec<String>, source_service: String) -> Self {
        Self::build(entity_type, entity_ids, InvalidationAction::Batch, source_service)
    }

    fn build(
        entity_type: EntityType,
        entity_ids: Vec<String>,
        action: InvalidationAction,
        source_service: String,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_ids,
            action,
            timestamp: chrono::Utc::now(),
            source_service,
        }
    }
}

/// Output interface for writers that must drop cached entities after commit.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    /// Invalidate a single cached entity
    async fn invalidate(&self, entity_id: &str) -> Result<()>;

    /// Invalidate many entities, returning how many ids were processed
    async fn invalidate_batch(&self, entity_ids: &[String]) -> Result<usize> {
        for id in entity_ids {
            self.invalidate(id).await?;
        }
        Ok(entity_ids.len())
    }
}

/// Invalidator for deployments without a cache in front of the store
#[derive(Debug, Clone, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl CacheInvalidator for NoopInvalidator {
    async fn invalidate(&self, _entity_id: &str) -> Result<()> {
        Ok(())
    }

    async fn invalidate_batch(&self, entity_ids: &[String]) -> Result<usize> {
        Ok(entity_ids.len())
    }
}

/// Retry settings for Redis deletes
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `attempt` (1-based): 500ms, 1s, 2s, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2_u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Deletes `{entity}:{id}` keys from Redis, optionally broadcasting the batch
#[derive(Clone)]
pub struct RedisCacheInvalidator {
    conn: ConnectionManager,
    entity_type: EntityType,
    service_name: String,
    broadcast_channel: Option<String>,
    retry: RetryConfig,
}

impl RedisCacheInvalidator {
    /// Default Redis channel for cache invalidation broadcasts
    pub const DEFAULT_CHANNEL: &'static str = "cache:invalidate";

    pub fn new(conn: ConnectionManager, entity_type: EntityType, service_name: String) -> Self {
        Self {
            conn,
            entity_type,
            service_name,
            broadcast_channel: None,
            retry: RetryConfig::default(),
        }
    }

    /// Also publish an [`InvalidationMessage`] on `channel` after deleting keys
    pub fn with_broadcast(mut self, channel: impl Into<String>) -> Self {
        self.broadcast_channel = Some(channel.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn delete_keys_with_retry(&self, keys: &[String]) -> Result<()> {
        for attempt in 1..=self.retry.max_attempts {
            let mut conn = self.conn.clone();
            match conn.del::<_, ()>(keys).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            attempt,
                            keys = keys.len(),
                            "Cache invalidation succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(e) if attempt == self.retry.max_attempts => {
                    return Err(InvalidationError::RetriesExhausted {
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Cache invalidation attempt failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }

        Err(InvalidationError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            message: "no attempts configured".to_string(),
        })
    }

    async fn broadcast(&self, msg: InvalidationMessage) -> Result<()> {
        let Some(channel) = &self.broadcast_channel else {
            return Ok(());
        };

        let payload = serde_json::to_string(&msg)?;
        let mut conn = self.conn.clone();
        let subscribers: usize = conn.publish(channel, payload).await?;

        debug!(
            message_id = %msg.message_id,
            channel = %channel,
            subscribers,
            "Invalidation message published"
        );
        Ok(())
    }
}

#[async_trait]
impl CacheInvalidator for RedisCacheInvalidator {
    async fn invalidate(&self, entity_id: &str) -> Result<()> {
        let key = build_cache_key(&self.entity_type, entity_id);
        self.delete_keys_with_retry(std::slice::from_ref(&key)).await?;
        self.broadcast(InvalidationMessage::delete(
            self.entity_type.clone(),
            entity_id.to_string(),
            self.service_name.clone(),
        ))
        .await
    }

    async fn invalidate_batch(&self, entity_ids: &[String]) -> Result<usize> {
        if entity_ids.is_empty() {
            return Ok(0);
        }

        let keys: Vec<String> = entity_ids
            .iter()
            .map(|id| build_cache_key(&self.entity_type, id))
            .collect();

        for chunk in keys.chunks(DEL_BATCH_SIZE) {
            self.delete_keys_with_retry(chunk).await?;
        }

        self.broadcast(InvalidationMessage::batch(
            self.entity_type.clone(),
            entity_ids.to_vec(),
            self.service_name.clone(),
        ))
        .await?;

        debug!(
            entity_type = %self.entity_type,
            count = entity_ids.len(),
            "Cache keys invalidated"
        );
        Ok(entity_ids.len())
    }
}
