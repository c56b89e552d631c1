//! Transaction discipline: `DbTransaction` warns via `tracing::warn!` if dropped
//! without an explicit commit or rollback, and `execute_with_retry` delegates to
//! `crate::retry::retry_with_backoff` for transient failures.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::DbError;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub struct DbTransaction<'a> {
    tx: Option<Transaction<'a, Postgres>>,
    committed: bool,
}

impl<'a> DbTransaction<'a> {
    pub fn new(tx: Transaction<'a, Postgres>) -> Self {
        Self {
            tx: Some(tx),
            committed: false,
        }
    }

    pub async fn commit(mut self) -> Result<(), DbError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        self.committed = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), DbError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        self.committed = true; // suppress the drop warning; this is an intentional rollback.
        Ok(())
    }
}

impl<'a> Deref for DbTransaction<'a> {
    type Target = Transaction<'a, Postgres>;
    fn deref(&self) -> &Self::Target {
        self.tx.as_ref().expect("transaction used after commit/rollback")
    }
}

impl<'a> DerefMut for DbTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tx.as_mut().expect("transaction used after commit/rollback")
    }
}

impl<'a> Drop for DbTransaction<'a> {
    fn drop(&mut self) {
        if !self.committed && self.tx.is_some() {
            tracing::warn!("transaction dropped without explicit commit or rollback");
        }
    }
}

pub struct TransactionManager {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl TransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    /// Run `f` inside a single transaction, committing on `Ok` and rolling back on
    /// `Err`. Every worker-owned state transition goes through this.
    pub async fn execute<T, F>(&self, f: F) -> Result<T, DbError>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'_, Postgres>,
        ) -> Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'c>>,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    /// As `execute`, but retries the whole transaction when `DbError::is_retryable()`.
    /// `make_fut` is called once per attempt so a fresh transaction closure can be
    /// built each time, since a `Transaction` cannot be reused after rollback.
    pub async fn execute_with_retry<T, F>(&self, make_fut: F) -> Result<T, DbError>
    where
        F: for<'c> Fn(
            &'c mut Transaction<'_, Postgres>,
        ) -> Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'c>>,
    {
        retry_with_backoff(
            &self.retry_policy,
            |_attempt| self.execute(&make_fut),
            DbError::is_retryable,
        )
        .await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, Clone, Copy)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub async fn set(&self, tx: &mut Transaction<'_, Postgres>) -> Result<(), DbError> {
        let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", self.as_sql());
        sqlx::query(&sql).execute(&mut **tx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_sql_strings() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
    }
}
