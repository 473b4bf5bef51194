//! Request-scoped database sessions.
//!
//! A [`Session`] is the unit of work handed to one request. It does not hold a
//! connection until it is first used; from then on every statement runs inside
//! a single transaction, so nothing is persisted until [`Session::commit`].
//!
//! Every exit path releases the pooled connection:
//!
//! - `commit()` / `rollback()` finish the transaction and return the connection
//! - dropping an uncommitted session rolls back (sqlx issues `ROLLBACK` when the
//!   transaction is dropped) and returns the connection

use sqlx_postgres::{PgConnection, PgPool, PgTransaction};

use crate::error::Result;

pub struct Session {
    pool: PgPool,
    /// Open transaction, or `None` until first use.
    tx: Option<PgTransaction<'static>>,
}

impl Session {
    pub(crate) fn new(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    /// Whether this session currently holds a pooled connection.
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Returns the connection backing this session, beginning the transaction
    /// on first call.
    ///
    /// Fails with [`crate::PostgresError::Connection`] when the database is
    /// unreachable or the pool is exhausted past its acquire timeout.
    pub async fn connection(&mut self) -> Result<&mut PgConnection> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => {
                let tx = self.pool.begin().await?;
                tracing::debug!("session transaction opened");
                tx
            }
        };
        Ok(&mut **self.tx.insert(tx))
    }

    /// Persists everything written through this session.
    ///
    /// Committing a session that was never used is a no-op.
    pub async fn commit(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            tracing::debug!("session committed");
        }
        Ok(())
    }

    /// Discards everything written through this session.
    pub async fn rollback(mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            tracing::debug!("session rolled back");
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("active", &self.is_active())
            .finish()
    }
}
