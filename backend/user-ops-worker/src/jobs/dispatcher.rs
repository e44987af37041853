use job_queue::{Delivery, FailureDisposition, JobFailure, JobQueue, QueueError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Instant;
use tracing::{error, info, warn};

use super::transaction::{execute, BulkOperation};
use super::DEFAULT_CHUNK_SIZE;
use crate::cache::InvalidationHook;
use crate::db::UserStore;
use crate::error::JobError;
use crate::metrics;
use crate::models::{BulkPayload, JobKind, JobResult, NewUser, UserPatch};

/// Routes deliveries to the bulk engines and reports outcomes to the queue.
///
/// Never retries on its own; redelivery is the queue's decision.
pub struct Dispatcher<S> {
    store: S,
    chunk_size: usize,
    hook: InvalidationHook,
}

impl<S: UserStore> Dispatcher<S> {
    pub fn new(store: S, hook: InvalidationHook) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            hook,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Handle one delivered job.
    ///
    /// On success the job's writes are committed and cache invalidation for
    /// the touched ids has been scheduled.
    pub async fn handle(&self, delivery: &Delivery) -> Result<JobResult, JobError> {
        let kind: JobKind = delivery.name.parse()?;

        let outcome = match kind {
            JobKind::BulkCreate => {
                let payload: BulkPayload<NewUser> = decode(delivery)?;
                execute(&self.store, BulkOperation::Create(&payload.users), self.chunk_size)
                    .await?
            }
            JobKind::BulkUpdate => {
                let payload: BulkPayload<UserPatch> = decode(delivery)?;
                execute(&self.store, BulkOperation::Update(&payload.users), self.chunk_size)
                    .await?
            }
        };

        self.hook.after_commit(&delivery.id, outcome.affected_ids).await;
        Ok(JobResult::completed(outcome.processed))
    }

    /// Wait for cache invalidations scheduled by completed jobs
    pub async fn drain_invalidations(&self) {
        self.hook.drain().await;
    }

    /// Handle a delivery and acknowledge it on `queue`.
    ///
    /// Returns an error only if the queue itself could not be updated.
    pub async fn process(&self, queue: &dyn JobQueue, delivery: Delivery) -> Result<(), QueueError> {
        let start = Instant::now();
        let job_label = metrics::job_type_label(&delivery.name);

        info!(
            job_id = %delivery.id,
            job_type = %delivery.name,
            attempt = delivery.attempt,
            "Job started"
        );

        match self.handle(&delivery).await {
            Ok(result) => {
                let elapsed = start.elapsed();
                let value = serde_json::to_value(&result)?;
                queue.complete(&delivery, value).await?;

                metrics::record_job_completed(
                    job_label,
                    result.processed,
                    elapsed.as_secs_f64(),
                );
                info!(
                    job_id = %delivery.id,
                    job_type = %delivery.name,
                    processed = result.processed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Job completed"
                );
            }
            Err(e) => {
                let elapsed = start.elapsed();
                let failure = JobFailure {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                };
                let disposition = queue.fail(&delivery, &failure).await?;

                let status = match disposition {
                    FailureDisposition::Retrying { .. } => "retrying",
                    FailureDisposition::DeadLettered => "dead_lettered",
                };
                metrics::record_job_failed(job_label, status, elapsed.as_secs_f64());

                match disposition {
                    FailureDisposition::Retrying { attempt, delay } => warn!(
                        job_id = %delivery.id,
                        job_type = %delivery.name,
                        error_kind = e.kind(),
                        error = %e,
                        next_attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        "Job failed, queued for retry"
                    ),
                    FailureDisposition::DeadLettered => error!(
                        job_id = %delivery.id,
                        job_type = %delivery.name,
                        error_kind = e.kind(),
                        error = %e,
                        attempts = delivery.attempt,
                        "Job failed permanently"
                    ),
                }
            }
        }

        Ok(())
    }
}

fn decode<T: DeserializeOwned>(delivery: &Delivery) -> Result<BulkPayload<T>, JobError> {
    Ok(BulkPayload::<T>::deserialize(&delivery.data)?)
}
