//! End-to-end bulk job tests against the in-memory store and queue

use async_trait::async_trait;
use cache_invalidation::{CacheInvalidator, InvalidationError, NoopInvalidator};
use job_queue::{InMemoryQueue, JobHandle, JobQueue, NewJob, RetryPolicy};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use user_ops_worker::cache::InvalidationHook;
use user_ops_worker::db::InMemoryUserStore;
use user_ops_worker::models::{NewUser, UserId};
use user_ops_worker::{Dispatcher, Worker};

const NO_WAIT: Duration = Duration::ZERO;

struct RecordingInvalidator {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl CacheInvalidator for RecordingInvalidator {
    async fn invalidate(&self, entity_id: &str) -> Result<(), InvalidationError> {
        let _ = self.tx.send(entity_id.to_string());
        Ok(())
    }
}

fn new_users(prefix: &str, n: usize) -> Vec<NewUser> {
    (0..n)
        .map(|i| NewUser {
            name: format!("{} {}", prefix, i),
            email: format!("{}{}@example.com", prefix, i),
            age: 20 + (i % 40) as i32,
        })
        .collect()
}

fn create_job(users: &[NewUser]) -> NewJob {
    NewJob::new("bulk-create", json!({ "users": users }))
}

fn update_job(users: Value) -> NewJob {
    NewJob::new("bulk-update", json!({ "users": users }))
}

fn no_backoff(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

fn dispatcher(store: &InMemoryUserStore) -> Dispatcher<InMemoryUserStore> {
    Dispatcher::new(
        store.clone(),
        InvalidationHook::new(Arc::new(NoopInvalidator)),
    )
}

async fn seed(store: &InMemoryUserStore, n: usize) -> Vec<UserId> {
    let mut ids = Vec::with_capacity(n);
    for user in new_users("seed", n) {
        ids.push(store.seed(user).await.unwrap());
    }
    ids
}

/// Dequeue and process every ready delivery on the current task
async fn drain(queue: &InMemoryQueue, dispatcher: &Dispatcher<InMemoryUserStore>) {
    while let Some(delivery) = queue.dequeue(NO_WAIT).await.unwrap() {
        dispatcher.process(queue, delivery).await.unwrap();
    }
}

#[tokio::test]
async fn test_bulk_create_250_users_in_three_chunks() {
    let store = InMemoryUserStore::new();
    let queue = InMemoryQueue::default();
    let d = dispatcher(&store);

    let handle = queue.enqueue(create_job(&new_users("user", 250))).await.unwrap();
    drain(&queue, &d).await;

    assert_eq!(
        queue.completed(&handle.id).await,
        Some(json!({"processed": 250, "status": "completed"}))
    );
    assert_eq!(store.statements_executed(), 3);
    assert_eq!(store.count().await, 250);
}

#[tokio::test]
async fn test_failing_last_chunk_leaves_row_count_unchanged() {
    let store = InMemoryUserStore::new();
    seed(&store, 5).await;
    let before = store.count().await;

    let queue = InMemoryQueue::new(no_backoff(2));
    let d = dispatcher(&store);

    let mut users = new_users("user", 249);
    // Same email as an existing row, placed in the last chunk
    users.push(new_users("seed", 1).remove(0));
    let handle = queue.enqueue(create_job(&users)).await.unwrap();

    drain(&queue, &d).await;

    assert_eq!(store.count().await, before);
    assert!(queue.completed(&handle.id).await.is_none());

    // Whole-job retry: both attempts ran all three chunks and failed
    let failed = queue.failed(&handle.id).await.expect("job dead-lettered");
    assert_eq!(failed.attempts, 2);
    assert!(failed.error.contains("users_email_key"));
    assert_eq!(store.statements_executed(), 6);
}

#[tokio::test]
async fn test_update_with_only_age_keeps_name_and_email() {
    let store = InMemoryUserStore::new();
    seed(&store, 10).await;
    let before = store.get(7).await.unwrap();

    let queue = InMemoryQueue::default();
    let handle = queue
        .enqueue(update_job(json!([{ "id": 7, "age": 30 }])))
        .await
        .unwrap();
    drain(&queue, &dispatcher(&store)).await;

    let after = store.get(7).await.unwrap();
    assert_eq!(after.name, before.name);
    assert_eq!(after.email, before.email);
    assert_eq!(after.age, 30);
    assert_eq!(
        queue.completed(&handle.id).await,
        Some(json!({"processed": 1, "status": "completed"}))
    );
}

#[tokio::test]
async fn test_update_with_only_name_keeps_email_and_age() {
    let store = InMemoryUserStore::new();
    let ids = seed(&store, 3).await;
    let before = store.get(ids[1]).await.unwrap();

    let queue = InMemoryQueue::default();
    queue
        .enqueue(update_job(json!([{ "id": ids[1], "name": "Renamed", "email": null }])))
        .await
        .unwrap();
    drain(&queue, &dispatcher(&store)).await;

    let after = store.get(ids[1]).await.unwrap();
    assert_eq!(after.name, "Renamed");
    assert_eq!(after.email, before.email);
    assert_eq!(after.age, before.age);
}

#[tokio::test]
async fn test_replayed_update_is_idempotent() {
    let store = InMemoryUserStore::new();
    let ids = seed(&store, 150).await;
    let d = dispatcher(&store);
    let queue = InMemoryQueue::default();

    let patches: Vec<Value> = ids
        .iter()
        .map(|id| json!({ "id": id, "age": 50, "name": format!("updated {}", id) }))
        .collect();

    queue.enqueue(update_job(json!(patches))).await.unwrap();
    drain(&queue, &d).await;
    let once = store.rows().await;

    queue.enqueue(update_job(json!(patches))).await.unwrap();
    drain(&queue, &d).await;
    let twice = store.rows().await;

    assert_eq!(once, twice);
    assert!(twice.iter().all(|row| row.age == 50));
}

#[tokio::test]
async fn test_unknown_job_type_is_dead_lettered_without_retry() {
    let store = InMemoryUserStore::new();
    let queue = InMemoryQueue::new(no_backoff(5));

    let handle = queue
        .enqueue(NewJob::new("bulk-delete", json!({ "users": [] })))
        .await
        .unwrap();
    drain(&queue, &dispatcher(&store)).await;

    let failed = queue.failed(&handle.id).await.expect("job dead-lettered");
    assert_eq!(failed.attempts, 1);
    assert!(failed.error.contains("bulk-delete"));
    assert_eq!(store.statements_executed(), 0);
}

#[tokio::test]
async fn test_empty_job_completes_with_zero_processed() {
    let store = InMemoryUserStore::new();
    let queue = InMemoryQueue::default();

    let handle = queue.enqueue(create_job(&[])).await.unwrap();
    drain(&queue, &dispatcher(&store)).await;

    assert_eq!(
        queue.completed(&handle.id).await,
        Some(json!({"processed": 0, "status": "completed"}))
    );
    assert_eq!(store.statements_executed(), 0);
}

#[tokio::test]
async fn test_committed_ids_are_invalidated() {
    let store = InMemoryUserStore::new();
    let existing = seed(&store, 2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let d = Dispatcher::new(
        store.clone(),
        InvalidationHook::new(Arc::new(RecordingInvalidator { tx })),
    );
    let queue = InMemoryQueue::default();

    queue.enqueue(create_job(&new_users("user", 3))).await.unwrap();
    queue
        .enqueue(update_job(json!([
            { "id": existing[0], "age": 99 },
            { "id": 4242, "age": 1 }
        ])))
        .await
        .unwrap();
    drain(&queue, &d).await;

    let mut seen = HashSet::new();
    while seen.len() < 4 {
        let id = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("invalidation not received")
            .expect("channel closed");
        seen.insert(id);
    }

    let expected: HashSet<String> = ["3", "4", "5"]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(existing[0].to_string()))
        .collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_rolled_back_job_invalidates_nothing() {
    let store = InMemoryUserStore::new();
    seed(&store, 1).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let d = Dispatcher::new(
        store.clone(),
        InvalidationHook::new(Arc::new(RecordingInvalidator { tx })),
    );
    let queue = InMemoryQueue::new(no_backoff(1));

    let mut users = new_users("user", 2);
    users.push(new_users("seed", 1).remove(0));
    queue.enqueue(create_job(&users)).await.unwrap();
    drain(&queue, &d).await;
    drop(d);

    // Sender dropped with the dispatcher; nothing was ever sent
    assert!(rx.recv().await.is_none());
}

async fn wait_for_completion(queue: &InMemoryQueue, handles: &[JobHandle]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = 0;
            for handle in handles {
                if queue.completed(&handle.id).await.is_some() {
                    done += 1;
                }
            }
            if done == handles.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not complete in time");
}

#[tokio::test]
async fn test_concurrent_disjoint_updates_both_apply() {
    let store = InMemoryUserStore::new();
    let ids = seed(&store, 20).await;
    let queue = Arc::new(InMemoryQueue::default());

    let first: Vec<Value> = ids[..10].iter().map(|id| json!({ "id": id, "age": 11 })).collect();
    let second: Vec<Value> = ids[10..].iter().map(|id| json!({ "id": id, "age": 22 })).collect();
    let handles = vec![
        queue.enqueue(update_job(json!(first))).await.unwrap(),
        queue.enqueue(update_job(json!(second))).await.unwrap(),
    ];

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = Worker::new(dispatcher(&store), queue.clone())
        .with_concurrency(2)
        .with_block(Duration::from_millis(20));
    let run = tokio::spawn(worker.run(shutdown_tx.clone()));

    wait_for_completion(&queue, &handles).await;
    shutdown_tx.send(()).unwrap();
    run.await.unwrap();

    for id in &ids[..10] {
        assert_eq!(store.get(*id).await.unwrap().age, 11);
    }
    for id in &ids[10..] {
        assert_eq!(store.get(*id).await.unwrap().age, 22);
    }
}

#[tokio::test]
async fn test_concurrent_overlapping_updates_do_not_mix_fields() {
    let store = InMemoryUserStore::new();
    let ids = seed(&store, 1).await;
    let id = ids[0];
    let queue = Arc::new(InMemoryQueue::default());

    let handles = vec![
        queue
            .enqueue(update_job(json!([{ "id": id, "name": "Alpha", "age": 1 }])))
            .await
            .unwrap(),
        queue
            .enqueue(update_job(json!([{ "id": id, "name": "Beta", "age": 2 }])))
            .await
            .unwrap(),
    ];

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = Worker::new(dispatcher(&store), queue.clone())
        .with_concurrency(2)
        .with_block(Duration::from_millis(20));
    let run = tokio::spawn(worker.run(shutdown_tx.clone()));

    wait_for_completion(&queue, &handles).await;
    shutdown_tx.send(()).unwrap();
    run.await.unwrap();

    let row = store.get(id).await.unwrap();
    assert!(
        (row.name == "Alpha" && row.age == 1) || (row.name == "Beta" && row.age == 2),
        "fields from different jobs were mixed: {:?}",
        row
    );
}

#[tokio::test]
async fn test_worker_stops_on_shutdown_when_idle() {
    let store = InMemoryUserStore::new();
    let queue = Arc::new(InMemoryQueue::default());

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = Worker::new(dispatcher(&store), queue)
        .with_concurrency(3)
        .with_block(Duration::from_secs(30));
    let run = tokio::spawn(worker.run(shutdown_tx.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("worker did not stop")
        .unwrap();
}

struct SlowInvalidator {
    delay: Duration,
    done: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl CacheInvalidator for SlowInvalidator {
    async fn invalidate(&self, _entity_id: &str) -> Result<(), InvalidationError> {
        tokio::time::sleep(self.delay).await;
        self.done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_pending_invalidations() {
    let store = InMemoryUserStore::new();
    let queue = Arc::new(InMemoryQueue::default());
    let done = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let d = Dispatcher::new(
        store.clone(),
        InvalidationHook::new(Arc::new(SlowInvalidator {
            delay: Duration::from_millis(300),
            done: done.clone(),
        })),
    );
    let handle = queue.enqueue(create_job(&new_users("user", 1))).await.unwrap();

    let (shutdown_tx, _) = broadcast::channel(1);
    let worker = Worker::new(d, queue.clone()).with_block(Duration::from_millis(20));
    let run = tokio::spawn(worker.run(shutdown_tx.clone()));

    wait_for_completion(&queue, &[handle]).await;
    shutdown_tx.send(()).unwrap();
    run.await.unwrap();

    assert_eq!(store.count().await, 1);
    assert_eq!(done.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_id_in_update_job_merges_all_fields() {
    let store = InMemoryUserStore::new();
    let ids = seed(&store, 1).await;
    let before = store.get(ids[0]).await.unwrap();
    let queue = InMemoryQueue::default();

    let handle = queue
        .enqueue(update_job(json!([
            { "id": ids[0], "age": 40 },
            { "id": ids[0], "name": "Second" }
        ])))
        .await
        .unwrap();
    drain(&queue, &dispatcher(&store)).await;

    let after = store.get(ids[0]).await.unwrap();
    assert_eq!(after.name, "Second");
    assert_eq!(after.email, before.email);
    assert_eq!(after.age, 40);
    assert_eq!(
        queue.completed(&handle.id).await,
        Some(json!({"processed": 2, "status": "completed"}))
    );
}
