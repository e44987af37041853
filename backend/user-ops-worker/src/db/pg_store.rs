use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{statements, UserStore, UserStoreTx};
use crate::error::StoreError;
use crate::models::{NewUser, UserId, UserPatch};
use crate::SERVICE_NAME;

/// PostgreSQL-backed user store
#[derive(Clone)]
pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Job transaction holding one pooled connection until commit or rollback
pub struct PgUserTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UserStore for PgUserStore {
    type Tx = PgUserTx;

    async fn begin(&self) -> Result<PgUserTx, StoreError> {
        let tx = db_pool::begin_with_metrics(&self.pool, SERVICE_NAME).await?;
        Ok(PgUserTx { tx })
    }
}

#[async_trait]
impl UserStoreTx for PgUserTx {
    async fn insert_chunk(&mut self, chunk: &[NewUser]) -> Result<Vec<UserId>, StoreError> {
        let mut qb = statements::insert_users(chunk);
        let ids = qb
            .build_query_scalar::<UserId>()
            .fetch_all(&mut *self.tx)
            .await?;

        debug!(rows = chunk.len(), "Insert chunk executed");
        Ok(ids)
    }

    async fn update_chunk(&mut self, chunk: &[UserPatch]) -> Result<Vec<UserId>, StoreError> {
        let mut qb = statements::update_users(chunk);
        let ids = qb
            .build_query_scalar::<UserId>()
            .fetch_all(&mut *self.tx)
            .await?;

        debug!(rows = chunk.len(), matched = ids.len(), "Update chunk executed");
        Ok(ids)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
