//! User store access
//!
//! A job opens exactly one transaction through [`UserStore::begin`] and runs
//! all of its chunk statements on it. Dropping a [`UserStoreTx`] without
//! committing rolls it back, so the connection is released on every exit
//! path, including task cancellation.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{NewUser, UserId, UserPatch};

mod memory;
mod pg_store;
pub mod statements;

pub use memory::{InMemoryTx, InMemoryUserStore, UserRow};
pub use pg_store::{PgUserStore, PgUserTx};

/// Source of job-scoped transactions
#[async_trait]
pub trait UserStore: Send + Sync {
    type Tx: UserStoreTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open transaction against the `users` table
#[async_trait]
pub trait UserStoreTx: Send + Sized {
    /// Insert one chunk with a single multi-row statement, returning the new ids
    async fn insert_chunk(&mut self, chunk: &[NewUser]) -> Result<Vec<UserId>, StoreError>;

    /// Merge-update one chunk with a single statement, returning the matched ids
    async fn update_chunk(&mut self, chunk: &[UserPatch]) -> Result<Vec<UserId>, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}
