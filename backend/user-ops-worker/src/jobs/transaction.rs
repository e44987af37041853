use tracing::warn;

use super::bulk_create::bulk_create;
use super::bulk_update::bulk_update;
use super::JobOutcome;
use crate::db::{UserStore, UserStoreTx};
use crate::error::StoreError;
use crate::models::{NewUser, UserPatch};

/// Records of one job, borrowed from its payload
#[derive(Debug, Clone, Copy)]
pub enum BulkOperation<'a> {
    Create(&'a [NewUser]),
    Update(&'a [UserPatch]),
}

impl BulkOperation<'_> {
    pub fn len(&self) -> usize {
        match self {
            BulkOperation::Create(users) => users.len(),
            BulkOperation::Update(patches) => patches.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run every chunk of `op` inside a single transaction.
///
/// Commits only if all chunks succeed. On the first error the transaction is
/// rolled back and the statement error is returned; a rollback failure is
/// logged and does not replace it. Empty input never opens a transaction.
pub async fn execute<S: UserStore>(
    store: &S,
    op: BulkOperation<'_>,
    chunk_size: usize,
) -> Result<JobOutcome, StoreError> {
    if op.is_empty() {
        return Ok(JobOutcome {
            processed: 0,
            affected_ids: Vec::new(),
        });
    }

    let mut tx = store.begin().await?;

    let applied = match op {
        BulkOperation::Create(users) => bulk_create(&mut tx, users, chunk_size).await,
        BulkOperation::Update(patches) => bulk_update(&mut tx, patches, chunk_size).await,
    };

    match applied {
        Ok(affected_ids) => {
            tx.commit().await?;
            Ok(JobOutcome {
                processed: op.len(),
                affected_ids,
            })
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed after statement error");
            }
            Err(e)
        }
    }
}
