//! Durable job queue contract
//!
//! Producers enqueue named jobs with a JSON payload; workers dequeue one
//! delivery at a time and report the outcome with [`JobQueue::complete`] or
//! [`JobQueue::fail`]. Delivery is at-least-once: a job may be handed out
//! again after a failure or after its lease expires, so handlers must be
//! safe to repeat.
//!
//! The queue owns the retry policy. A failed delivery is either scheduled
//! again with exponential backoff or moved to the dead-letter set once its
//! attempt budget is spent (or the failure is marked non-retryable).
//!
//! Two backends share the contract:
//! - [`RedisStreamQueue`]: Redis Streams with a consumer group
//! - [`InMemoryQueue`]: process-local, for tests and single-process tools

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

mod error;
mod memory;
mod redis_streams;

pub use error::QueueError;
pub use memory::InMemoryQueue;
pub use redis_streams::{RedisQueueConfig, RedisStreamQueue};

pub type Result<T> = std::result::Result<T, QueueError>;

/// Job submitted by a producer
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
}

impl NewJob {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// Per-job overrides of the queue policy
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub max_attempts: Option<u32>,
}

/// Handle returned from [`JobQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: String,
}

/// One delivery attempt of a job
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: String,
    pub name: String,
    pub data: Value,
    /// 1-based attempt number of this delivery
    pub attempt: u32,
    pub max_attempts: u32,
    /// Backend-specific token used to acknowledge this delivery
    pub receipt: String,
}

/// Failure reported by a handler
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    /// Hint that redelivering the same payload can succeed
    pub retryable: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// What the queue did with a failed delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Scheduled again; `attempt` is the number of the next delivery
    Retrying { attempt: u32, delay: Duration },
    /// Moved to the dead-letter set
    DeadLettered,
}

/// Retry/backoff policy applied to failed deliveries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry that follows failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Decide the fate of a failed delivery
    pub fn disposition(&self, delivery: &Delivery, failure: &JobFailure) -> FailureDisposition {
        if !failure.retryable || delivery.attempt >= delivery.max_attempts {
            FailureDisposition::DeadLettered
        } else {
            FailureDisposition::Retrying {
                attempt: delivery.attempt + 1,
                delay: self.backoff(delivery.attempt),
            }
        }
    }

    pub(crate) fn attempts_for(&self, options: &JobOptions) -> u32 {
        options.max_attempts.unwrap_or(self.max_attempts).max(1)
    }
}

/// Record kept for a dead-lettered job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub attempts: u32,
    pub error: String,
    pub failed_at: chrono::DateTime<chrono::Utc>,
}

impl FailedJob {
    pub fn new(delivery: &Delivery, attempts: u32, error: String) -> Self {
        Self {
            id: delivery.id.clone(),
            name: delivery.name.clone(),
            data: delivery.data.clone(),
            attempts,
            error,
            failed_at: chrono::Utc::now(),
        }
    }
}

/// Job as persisted by a backend between deliveries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredJob {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl StoredJob {
    pub(crate) fn new(job: NewJob, policy: &RetryPolicy) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            max_attempts: policy.attempts_for(&job.options),
            name: job.name,
            data: job.data,
            attempt: 1,
        }
    }

    pub(crate) fn from_delivery(delivery: &Delivery, attempt: u32) -> Self {
        Self {
            id: delivery.id.clone(),
            name: delivery.name.clone(),
            data: delivery.data.clone(),
            attempt,
            max_attempts: delivery.max_attempts,
        }
    }

    pub(crate) fn into_delivery(self, receipt: String) -> Delivery {
        Delivery {
            id: self.id,
            name: self.name,
            data: self.data,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            receipt,
        }
    }
}

/// Queue contract consumed by workers and producers
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Persist a job for later delivery
    async fn enqueue(&self, job: NewJob) -> Result<JobHandle>;

    /// Wait up to `block` for the next delivery
    async fn dequeue(&self, block: Duration) -> Result<Option<Delivery>>;

    /// Mark a delivery completed and store its result
    async fn complete(&self, delivery: &Delivery, result: Value) -> Result<()>;

    /// Mark a delivery failed; the queue decides between retry and dead-letter
    async fn fail(&self, delivery: &Delivery, failure: &JobFailure) -> Result<FailureDisposition>;
}
