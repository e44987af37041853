//! Redis Streams queue backend
//!
//! Layout for a queue named `{name}`:
//!
//! ```text
//! queue:{name}:jobs        stream, one entry per ready delivery (field `job`)
//! {name}-workers           consumer group on the stream
//! queue:{name}:delayed     sorted set of retries, scored by ready-at (ms)
//! queue:{name}:completed   hash job_id -> result JSON
//! queue:{name}:failed      hash job_id -> dead-letter record JSON
//! ```
//!
//! An entry stays in the group's pending list until the worker acknowledges
//! it. Entries idle longer than the lease timeout are claimed by the next
//! worker that polls, which gives at-least-once delivery across crashes.

use crate::{
    Delivery, FailedJob, FailureDisposition, JobFailure, JobHandle, JobQueue, NewJob, QueueError,
    Result, RetryPolicy, StoredJob,
};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Moves due retries from the delayed set back onto the stream atomically.
const PROMOTE_DUE_SCRIPT: &str = r#"
    local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
    for _, job in ipairs(due) do
        redis.call('ZREM', KEYS[1], job)
        redis.call('XADD', KEYS[2], '*', 'job', job)
    end
    return #due
"#;

const PROMOTE_BATCH: usize = 100;
const RECLAIM_SCAN: usize = 10;
const JOB_FIELD: &str = "job";

/// Configuration for a Redis Streams queue
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    pub queue_name: String,
    /// Consumer name inside the group (one per process)
    pub consumer_name: String,
    pub policy: RetryPolicy,
    /// Pending entries idle longer than this are redelivered
    pub lease_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "user-operations".to_string(),
            consumer_name: format!("worker-{}", uuid::Uuid::new_v4()),
            policy: RetryPolicy::default(),
            lease_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
struct Keys {
    stream: String,
    group: String,
    delayed: String,
    completed: String,
    failed: String,
}

impl Keys {
    fn new(queue_name: &str) -> Self {
        Self {
            stream: format!("queue:{}:jobs", queue_name),
            group: format!("{}-workers", queue_name),
            delayed: format!("queue:{}:delayed", queue_name),
            completed: format!("queue:{}:completed", queue_name),
            failed: format!("queue:{}:failed", queue_name),
        }
    }
}

/// [`JobQueue`] backed by a Redis stream and consumer group
pub struct RedisStreamQueue {
    client: redis::Client,
    conn: ConnectionManager,
    config: RedisQueueConfig,
    keys: Keys,
    promote_script: redis::Script,
    /// Idle connections for blocking reads, one per concurrent reader
    blocking_conns: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStreamQueue {
    /// Connect and make sure the consumer group exists
    pub async fn connect(client: redis::Client, config: RedisQueueConfig) -> Result<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;
        let queue = Self {
            client,
            conn,
            keys: Keys::new(&config.queue_name),
            config,
            promote_script: redis::Script::new(PROMOTE_DUE_SCRIPT),
            blocking_conns: Mutex::new(Vec::new()),
        };
        queue.ensure_consumer_group().await?;

        info!(
            queue = %queue.config.queue_name,
            consumer = %queue.config.consumer_name,
            "Redis stream queue ready"
        );
        Ok(queue)
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    /// Result stored for a completed job
    pub async fn completed(&self, job_id: &str) -> Result<Option<Value>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(&self.keys.completed, job_id).await?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(QueueError::from)
    }

    /// Dead-letter record for a failed job
    pub async fn failed(&self, job_id: &str) -> Result<Option<FailedJob>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(&self.keys.failed, job_id).await?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(QueueError::from)
    }

    async fn ensure_consumer_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&self.keys.stream, &self.keys.group, "0")
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn promote_due(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let now_ms = chrono::Utc::now().timestamp_millis();

        let moved: usize = self
            .promote_script
            .key(&self.keys.delayed)
            .key(&self.keys.stream)
            .arg(now_ms)
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;

        if moved > 0 {
            debug!(queue = %self.config.queue_name, moved, "Promoted delayed retries");
        }
        Ok(())
    }

    /// Claim one pending entry whose lease has expired
    async fn claim_stalled(&self) -> Result<Option<Delivery>> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.keys.stream, &self.keys.group, "-", "+", RECLAIM_SCAN)
            .await?;

        let lease_ms = self.config.lease_timeout.as_millis() as usize;
        let Some(stalled) = pending
            .ids
            .into_iter()
            .find(|p| p.last_delivered_ms >= lease_ms)
        else {
            return Ok(None);
        };

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.keys.stream,
                &self.keys.group,
                &self.config.consumer_name,
                lease_ms,
                &[&stalled.id],
            )
            .await?;

        // Another worker may have claimed it first
        let Some(entry) = claimed.ids.into_iter().next() else {
            return Ok(None);
        };

        let mut delivery = self.decode_entry(entry).await?;
        delivery.attempt = attempt_after_stalls(delivery.attempt, stalled.times_delivered);

        if delivery.attempt > delivery.max_attempts {
            let attempts = delivery.attempt - 1;
            error!(
                queue = %self.config.queue_name,
                job_id = %delivery.id,
                entry_id = %delivery.receipt,
                previous_consumer = %stalled.consumer,
                attempts,
                "Stalled job exceeded its attempts, dead-lettering"
            );
            self.dead_letter_stalled(&delivery, attempts).await?;
            return Ok(None);
        }

        warn!(
            queue = %self.config.queue_name,
            job_id = %delivery.id,
            entry_id = %delivery.receipt,
            previous_consumer = %stalled.consumer,
            attempt = delivery.attempt,
            "Reclaimed stalled job"
        );
        Ok(Some(delivery))
    }

    async fn dead_letter_stalled(&self, delivery: &Delivery, attempts: u32) -> Result<()> {
        let record = serde_json::to_string(&FailedJob::new(
            delivery,
            attempts,
            format!("job stalled without completing after {} attempts", attempts),
        ))?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .xack(&self.keys.stream, &self.keys.group, &[&delivery.receipt])
            .ignore()
            .xdel(&self.keys.stream, &[&delivery.receipt])
            .ignore()
            .hset(&self.keys.failed, &delivery.id, record)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_new(&self, block: Duration) -> Result<Option<Delivery>> {
        // A blocking XREADGROUP holds its connection until it returns, so
        // each concurrent reader needs its own. They are pooled for reuse.
        let pooled = self.blocking_conns.lock().await.pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => self.client.get_multiplexed_async_connection().await?,
        };

        let mut opts = StreamReadOptions::default()
            .group(&self.keys.group, &self.config.consumer_name)
            .count(1);
        if !block.is_zero() {
            opts = opts.block(block.as_millis() as usize);
        }

        // On error the connection is dropped rather than pooled
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.keys.stream], &[">"], &opts)
            .await?;
        self.blocking_conns.lock().await.push(conn);

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();

        match entry {
            Some(entry) => self.decode_entry(entry).await.map(Some),
            None => Ok(None),
        }
    }

    async fn decode_entry(&self, entry: StreamId) -> Result<Delivery> {
        let decoded = entry
            .get::<String>(JOB_FIELD)
            .ok_or_else(|| "missing job field".to_string())
            .and_then(|raw| {
                serde_json::from_str::<StoredJob>(&raw).map_err(|e| e.to_string())
            });

        match decoded {
            Ok(job) => Ok(job.into_delivery(entry.id)),
            Err(reason) => {
                // Drop the poison entry so it is not reclaimed forever
                error!(
                    queue = %self.config.queue_name,
                    entry_id = %entry.id,
                    reason = %reason,
                    "Discarding malformed queue entry"
                );
                self.ack_and_delete(&entry.id).await?;
                Err(QueueError::MalformedEntry {
                    entry_id: entry.id,
                    reason,
                })
            }
        }
    }

    async fn ack_and_delete(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .xack(&self.keys.stream, &self.keys.group, &[entry_id])
            .ignore()
            .xdel(&self.keys.stream, &[entry_id])
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Attempt number of a reclaimed entry. Each earlier delivery of the entry
/// stalled and used up one attempt.
fn attempt_after_stalls(stored_attempt: u32, times_delivered: usize) -> u32 {
    let stalls = u32::try_from(times_delivered).unwrap_or(u32::MAX);
    stored_attempt.saturating_add(stalls)
}

#[async_trait]
impl JobQueue for RedisStreamQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobHandle> {
        let stored = StoredJob::new(job, &self.config.policy);
        let payload = serde_json::to_string(&stored)?;

        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(&self.keys.stream, "*", &[(JOB_FIELD, payload.as_str())])
            .await?;

        debug!(
            queue = %self.config.queue_name,
            job_id = %stored.id,
            job_type = %stored.name,
            entry_id = %entry_id,
            "Job enqueued"
        );
        Ok(JobHandle { id: stored.id })
    }

    async fn dequeue(&self, block: Duration) -> Result<Option<Delivery>> {
        self.promote_due().await?;

        if let Some(delivery) = self.claim_stalled().await? {
            return Ok(Some(delivery));
        }

        self.read_new(block).await
    }

    async fn complete(&self, delivery: &Delivery, result: Value) -> Result<()> {
        let payload = serde_json::to_string(&result)?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .xack(&self.keys.stream, &self.keys.group, &[&delivery.receipt])
            .ignore()
            .xdel(&self.keys.stream, &[&delivery.receipt])
            .ignore()
            .hset(&self.keys.completed, &delivery.id, payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, failure: &JobFailure) -> Result<FailureDisposition> {
        let disposition = self.config.policy.disposition(delivery, failure);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .xack(&self.keys.stream, &self.keys.group, &[&delivery.receipt])
            .ignore()
            .xdel(&self.keys.stream, &[&delivery.receipt])
            .ignore();

        match &disposition {
            FailureDisposition::Retrying { attempt, delay } => {
                let retry = serde_json::to_string(&StoredJob::from_delivery(delivery, *attempt))?;
                let ready_at = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
                pipe.zadd(&self.keys.delayed, retry, ready_at).ignore();
            }
            FailureDisposition::DeadLettered => {
                let record = serde_json::to_string(&FailedJob::new(
                    delivery,
                    delivery.attempt,
                    failure.message.clone(),
                ))?;
                pipe.hset(&self.keys.failed, &delivery.id, record).ignore();
            }
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(disposition)
    }
}
