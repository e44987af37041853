use tracing::debug;

use crate::db::UserStoreTx;
use crate::error::StoreError;
use crate::metrics;
use crate::models::{NewUser, UserId};

/// Insert `users` in order-preserving chunks of at most `chunk_size`.
///
/// Runs on the caller's transaction and stops at the first failing chunk;
/// the caller decides whether to commit. Returns the store-assigned ids.
pub async fn bulk_create<T: UserStoreTx>(
    tx: &mut T,
    users: &[NewUser],
    chunk_size: usize,
) -> Result<Vec<UserId>, StoreError> {
    let mut ids = Vec::with_capacity(users.len());

    for (index, chunk) in users.chunks(chunk_size.max(1)).enumerate() {
        let inserted = tx.insert_chunk(chunk).await?;
        metrics::record_chunk("insert");

        debug!(chunk = index, rows = chunk.len(), "Bulk insert chunk applied");
        ids.extend(inserted);
    }

    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InMemoryUserStore, UserStore};

    fn users(n: usize) -> Vec<NewUser> {
        (0..n)
            .map(|i| NewUser {
                name: format!("user{}", i),
                email: format!("user{}@example.com", i),
                age: 18 + (i % 50) as i32,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_chunks_are_ceil_of_input() {
        let store = InMemoryUserStore::new();
        let mut tx = store.begin().await.unwrap();

        let ids = bulk_create(&mut tx, &users(250), 100).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(ids.len(), 250);
        assert_eq!(store.statements_executed(), 3);
        assert_eq!(store.count().await, 250);
    }

    #[tokio::test]
    async fn test_ids_follow_input_order() {
        let store = InMemoryUserStore::new();
        let mut tx = store.begin().await.unwrap();

        let input = users(5);
        let ids = bulk_create(&mut tx, &input, 2).await.unwrap();
        tx.commit().await.unwrap();

        for (id, user) in ids.iter().zip(&input) {
            assert_eq!(store.get(*id).await.unwrap().email, user.email);
        }
    }

    #[tokio::test]
    async fn test_empty_input_executes_nothing() {
        let store = InMemoryUserStore::new();
        let mut tx = store.begin().await.unwrap();

        let ids = bulk_create(&mut tx, &[], 100).await.unwrap();

        assert!(ids.is_empty());
        assert_eq!(store.statements_executed(), 0);
    }
}
