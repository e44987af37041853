//! Post-commit cache invalidation

use cache_invalidation::CacheInvalidator;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::models::UserId;

/// Drops cached `user:{id}` entries for rows a committed job touched.
///
/// Runs in background tasks so job completion never waits on the cache.
/// Failures are logged and counted; the committed data stays as is.
/// Clones share the same task set, so [`InvalidationHook::drain`] on any
/// clone waits for every scheduled invalidation.
#[derive(Clone)]
pub struct InvalidationHook {
    invalidator: Arc<dyn CacheInvalidator>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl InvalidationHook {
    pub fn new(invalidator: Arc<dyn CacheInvalidator>) -> Self {
        Self {
            invalidator,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Call only after the job's transaction has committed.
    ///
    /// Returns whether an invalidation was scheduled.
    pub async fn after_commit(&self, job_id: &str, ids: Vec<UserId>) -> bool {
        if ids.is_empty() {
            return false;
        }

        let invalidator = self.invalidator.clone();
        let job_id = job_id.to_string();
        let keys: Vec<String> = ids.iter().map(|id| id.to_string()).collect();

        let mut tasks = self.tasks.lock().await;
        // Reap finished tasks so the set only holds in-flight work
        while tasks.try_join_next().is_some() {}

        tasks.spawn(async move {
            match invalidator.invalidate_batch(&keys).await {
                Ok(count) => {
                    debug!(job_id = %job_id, count, "User cache entries invalidated");
                }
                Err(e) => {
                    metrics::record_invalidation_failure();
                    warn!(
                        job_id = %job_id,
                        ids = keys.len(),
                        error = %e,
                        "Cache invalidation failed; entries may be stale until TTL"
                    );
                }
            }
        });
        true
    }

    /// Wait for every scheduled invalidation to finish
    pub async fn drain(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            return;
        }

        info!(pending = tasks.len(), "Waiting for cache invalidations");
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Cache invalidation task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cache_invalidation::InvalidationError;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CacheInvalidator for Recorder {
        async fn invalidate(&self, entity_id: &str) -> Result<(), InvalidationError> {
            self.seen.lock().await.push(entity_id.to_string());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CacheInvalidator for Failing {
        async fn invalidate(&self, _entity_id: &str) -> Result<(), InvalidationError> {
            Err(InvalidationError::RetriesExhausted {
                attempts: 3,
                message: "connection refused".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_invalidates_every_id() {
        let recorder = Arc::new(Recorder::default());
        let hook = InvalidationHook::new(recorder.clone());

        assert!(hook.after_commit("job-1", vec![7, 8, 9]).await);
        hook.drain().await;

        assert_eq!(*recorder.seen.lock().await, vec!["7", "8", "9"]);
    }

    #[tokio::test]
    async fn test_no_ids_no_task() {
        let hook = InvalidationHook::new(Arc::new(Recorder::default()));
        assert!(!hook.after_commit("job-1", Vec::new()).await);
    }

    #[tokio::test]
    async fn test_failure_is_contained() {
        let hook = InvalidationHook::new(Arc::new(Failing));
        assert!(hook.after_commit("job-1", vec![1]).await);
        hook.drain().await;
    }

    struct Slow {
        delay: Duration,
        done: Arc<Recorder>,
    }

    #[async_trait]
    impl CacheInvalidator for Slow {
        async fn invalidate(&self, entity_id: &str) -> Result<(), InvalidationError> {
            tokio::time::sleep(self.delay).await;
            self.done.invalidate(entity_id).await
        }
    }

    #[tokio::test]
    async fn test_drain_waits_for_slow_invalidations() {
        let done = Arc::new(Recorder::default());
        let hook = InvalidationHook::new(Arc::new(Slow {
            delay: Duration::from_millis(200),
            done: done.clone(),
        }));

        hook.after_commit("job-1", vec![1]).await;
        hook.after_commit("job-2", vec![2]).await;
        assert!(done.seen.lock().await.is_empty());

        hook.clone().drain().await;
        let mut seen = done.seen.lock().await.clone();
        seen.sort();
        assert_eq!(seen, vec!["1", "2"]);
    }
}
