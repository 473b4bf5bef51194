//! The process-wide database handle.

use sqlx_postgres::PgPool;
use tracing::instrument;

use crate::config::PostgresConfig;
use crate::error::Result;
use crate::pool::create_lazy_pool;
use crate::session::Session;

/// Owns the PostgreSQL pool for the lifetime of the process.
///
/// Cloning is cheap and shares the same pool; hand clones to whatever needs
/// sessions rather than reaching for a global.
#[derive(Clone, Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Builds the pool from configuration without connecting.
    pub fn connect_lazy(config: &PostgresConfig) -> Result<Self> {
        Ok(Self {
            pool: create_lazy_pool(config)?,
        })
    }

    /// Opens a new request-scoped session. No connection is taken until the
    /// session is used.
    pub fn session(&self) -> Session {
        Session::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Round-trips `SELECT 1` through a throwaway session.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let mut session = self.session();
        let conn = session.connection().await?;
        sqlx_core::query::query("SELECT 1").execute(conn).await?;
        session.rollback().await
    }

    /// Closes the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("PostgreSQL connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
