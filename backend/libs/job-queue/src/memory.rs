//! Process-local queue backend

use crate::{
    Delivery, FailedJob, FailureDisposition, JobFailure, JobHandle, JobQueue, NewJob, QueueError,
    Result, RetryPolicy, StoredJob,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

#[derive(Default)]
struct State {
    ready: VecDeque<StoredJob>,
    delayed: Vec<(Instant, StoredJob)>,
    in_flight: HashMap<String, StoredJob>,
    completed: HashMap<String, Value>,
    failed: HashMap<String, FailedJob>,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, job) = self.delayed.remove(i);
                self.ready.push_back(job);
            } else {
                i += 1;
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(at, _)| *at).min()
    }
}

/// In-memory [`JobQueue`] with the same retry semantics as the Redis backend.
///
/// Jobs are delivered in FIFO order; retries wait out their backoff in a
/// delayed list before becoming ready again.
pub struct InMemoryQueue {
    policy: RetryPolicy,
    state: Mutex<State>,
    notify: Notify,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl InMemoryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Result stored for a completed job
    pub async fn completed(&self, job_id: &str) -> Option<Value> {
        self.state.lock().await.completed.get(job_id).cloned()
    }

    /// Dead-letter record for a failed job
    pub async fn failed(&self, job_id: &str) -> Option<FailedJob> {
        self.state.lock().await.failed.get(job_id).cloned()
    }

    /// Jobs waiting for delivery, including delayed retries
    pub async fn pending_len(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    /// Deliveries handed out but not yet completed or failed
    pub async fn in_flight_len(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    async fn take_in_flight(&self, delivery: &Delivery) -> Result<StoredJob> {
        self.state
            .lock()
            .await
            .in_flight
            .remove(&delivery.receipt)
            .ok_or_else(|| QueueError::UnknownDelivery(delivery.receipt.clone()))
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobHandle> {
        let stored = StoredJob::new(job, &self.policy);
        let handle = JobHandle {
            id: stored.id.clone(),
        };

        self.state.lock().await.ready.push_back(stored);
        self.notify.notify_one();

        debug!(job_id = %handle.id, "Job enqueued");
        Ok(handle)
    }

    async fn dequeue(&self, block: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + block;

        loop {
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.promote_due(now);

                if let Some(job) = state.ready.pop_front() {
                    let receipt = job.id.clone();
                    state.in_flight.insert(receipt.clone(), job.clone());
                    return Ok(Some(job.into_delivery(receipt)));
                }

                if now >= deadline {
                    return Ok(None);
                }

                state
                    .next_due()
                    .map_or(deadline, |due| due.min(deadline))
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn complete(&self, delivery: &Delivery, result: Value) -> Result<()> {
        let job = self.take_in_flight(delivery).await?;
        self.state.lock().await.completed.insert(job.id, result);
        Ok(())
    }

    async fn fail(&self, delivery: &Delivery, failure: &JobFailure) -> Result<FailureDisposition> {
        let job = self.take_in_flight(delivery).await?;
        let disposition = self.policy.disposition(delivery, failure);

        let mut state = self.state.lock().await;
        match &disposition {
            FailureDisposition::Retrying { attempt, delay } => {
                let retry = StoredJob::from_delivery(delivery, *attempt);
                state.delayed.push((Instant::now() + *delay, retry));
                drop(state);
                self.notify.notify_one();
            }
            FailureDisposition::DeadLettered => {
                state.failed.insert(
                    job.id.clone(),
                    FailedJob {
                        id: job.id,
                        name: job.name,
                        data: job.data,
                        attempts: delivery.attempt,
                        error: failure.message.clone(),
                        failed_at: chrono::Utc::now(),
                    },
                );
            }
        }

        Ok(disposition)
    }
}
