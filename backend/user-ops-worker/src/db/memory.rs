//! In-process user store
//!
//! Behaves like the `users` table for the bulk paths: store-assigned ids,
//! non-empty `name`/`email`, unique `email`, and all-or-nothing transactions.
//! A transaction holds the table lock from `begin` until it ends, which
//! serializes concurrent jobs the way row locks would for overlapping ids.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{UserStore, UserStoreTx};
use crate::error::StoreError;
use crate::models::{NewUser, UserId, UserPatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRow {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub age: i32,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: BTreeMap<UserId, UserRow>,
    next_id: UserId,
}

impl Table {
    fn check_row(&self, row: &UserRow) -> Result<(), StoreError> {
        if row.name.is_empty() {
            return Err(StoreError::ConstraintViolation(
                "null value in column \"name\"".to_string(),
            ));
        }
        if row.email.is_empty() {
            return Err(StoreError::ConstraintViolation(
                "null value in column \"email\"".to_string(),
            ));
        }
        let duplicate = self
            .rows
            .values()
            .any(|other| other.id != row.id && other.email == row.email);
        if duplicate {
            return Err(StoreError::ConstraintViolation(format!(
                "duplicate key value violates unique constraint \"users_email_key\": {}",
                row.email
            )));
        }
        Ok(())
    }

    fn insert(&mut self, user: &NewUser) -> Result<UserId, StoreError> {
        let row = UserRow {
            id: self.next_id + 1,
            name: user.name.clone(),
            email: user.email.clone(),
            age: user.age,
        };
        self.check_row(&row)?;
        self.next_id = row.id;
        self.rows.insert(row.id, row);
        Ok(self.next_id)
    }

    fn merge(&mut self, patch: &UserPatch) -> Result<Option<UserId>, StoreError> {
        let Some(existing) = self.rows.get(&patch.id) else {
            return Ok(None);
        };

        let merged = UserRow {
            id: existing.id,
            name: patch.name.clone().unwrap_or_else(|| existing.name.clone()),
            email: patch.email.clone().unwrap_or_else(|| existing.email.clone()),
            age: patch.age.unwrap_or(existing.age),
        };
        self.check_row(&merged)?;
        self.rows.insert(merged.id, merged);
        Ok(Some(patch.id))
    }
}

/// Shared in-memory table; clones see the same data
#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    table: Arc<Mutex<Table>>,
    statements: Arc<AtomicUsize>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row outside any job, returning its id
    pub async fn seed(&self, user: NewUser) -> Result<UserId, StoreError> {
        self.table.lock().await.insert(&user)
    }

    pub async fn get(&self, id: UserId) -> Option<UserRow> {
        self.table.lock().await.rows.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn rows(&self) -> Vec<UserRow> {
        self.table.lock().await.rows.values().cloned().collect()
    }

    /// Chunk statements executed so far, committed or not
    pub fn statements_executed(&self) -> usize {
        self.statements.load(Ordering::SeqCst)
    }
}

/// Transaction over a staged copy of the table
pub struct InMemoryTx {
    guard: OwnedMutexGuard<Table>,
    staged: Table,
    statements: Arc<AtomicUsize>,
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        let guard = self.table.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryTx {
            guard,
            staged,
            statements: self.statements.clone(),
        })
    }
}

#[async_trait]
impl UserStoreTx for InMemoryTx {
    async fn insert_chunk(&mut self, chunk: &[NewUser]) -> Result<Vec<UserId>, StoreError> {
        self.statements.fetch_add(1, Ordering::SeqCst);

        // A failing statement leaves no rows behind, like a single INSERT
        let mut scratch = self.staged.clone();
        let ids = chunk
            .iter()
            .map(|user| scratch.insert(user))
            .collect::<Result<Vec<_>, _>>()?;
        self.staged = scratch;
        Ok(ids)
    }

    async fn update_chunk(&mut self, chunk: &[UserPatch]) -> Result<Vec<UserId>, StoreError> {
        self.statements.fetch_add(1, Ordering::SeqCst);

        let mut scratch = self.staged.clone();
        let mut matched = Vec::with_capacity(chunk.len());
        for patch in chunk {
            if let Some(id) = scratch.merge(patch)? {
                matched.push(id);
            }
        }
        self.staged = scratch;
        Ok(matched)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        *self.guard = self.staged;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
