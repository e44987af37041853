//! Worker slots pulling from the queue
//!
//! Each slot handles at most one job at a time. Shutdown is only observed
//! while waiting for the next delivery; a job that has started always runs
//! to completion or failure before its slot exits.

use job_queue::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::UserStore;
use crate::jobs::Dispatcher;

const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub struct Worker<S> {
    dispatcher: Arc<Dispatcher<S>>,
    queue: Arc<dyn JobQueue>,
    concurrency: usize,
    block: Duration,
}

impl<S> Worker<S>
where
    S: UserStore + 'static,
{
    pub fn new(dispatcher: Dispatcher<S>, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            queue,
            concurrency: 1,
            block: Duration::from_secs(5),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// How long one dequeue waits before checking for shutdown again
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    /// Spawn all slots; they stop after `shutdown` fires or is dropped
    pub fn spawn(self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(concurrency = self.concurrency, "Starting worker slots");

        (0..self.concurrency)
            .map(|slot| {
                tokio::spawn(run_slot(
                    slot,
                    self.dispatcher.clone(),
                    self.queue.clone(),
                    self.block,
                    shutdown.subscribe(),
                ))
            })
            .collect()
    }

    /// Run until shutdown, then wait for in-flight jobs and their cache
    /// invalidations to finish
    pub async fn run(self, shutdown: broadcast::Sender<()>) {
        let dispatcher = self.dispatcher.clone();
        let handles = self.spawn(&shutdown);
        drop(shutdown);

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Worker slot panicked");
            }
        }
        dispatcher.drain_invalidations().await;
        info!("All worker slots stopped");
    }
}

async fn run_slot<S: UserStore>(
    slot: usize,
    dispatcher: Arc<Dispatcher<S>>,
    queue: Arc<dyn JobQueue>,
    block: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut consecutive_errors = 0u32;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            next = queue.dequeue(block) => next,
        };

        match next {
            Ok(Some(delivery)) => {
                consecutive_errors = 0;
                if let Err(e) = dispatcher.process(queue.as_ref(), delivery).await {
                    // The delivery stays pending and is reclaimed after its lease
                    error!(slot, error = %e, "Failed to report job outcome to queue");
                }
            }
            Ok(None) => {
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors = consecutive_errors.saturating_add(1);
                let backoff = error_backoff(consecutive_errors);
                warn!(
                    slot,
                    error = %e,
                    consecutive_errors,
                    backoff_ms = backoff.as_millis() as u64,
                    "Dequeue failed"
                );

                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    info!(slot, "Worker slot stopped");
}

/// 200ms, 400ms, 800ms, ... capped at 5s
fn error_backoff(consecutive_errors: u32) -> Duration {
    let factor = 2_u32.saturating_pow(consecutive_errors.saturating_sub(1).min(16));
    (Duration::from_millis(200) * factor).min(MAX_ERROR_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_backoff_is_capped() {
        assert_eq!(error_backoff(1), Duration::from_millis(200));
        assert_eq!(error_backoff(2), Duration::from_millis(400));
        assert_eq!(error_backoff(10), MAX_ERROR_BACKOFF);
        assert_eq!(error_backoff(u32::MAX), MAX_ERROR_BACKOFF);
    }
}
