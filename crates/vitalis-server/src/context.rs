//! Process-wide resources, built once at startup and shared by every request.

use std::convert::Infallible;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use thiserror::Error;
use vitalis_db_postgres::{Database, PostgresError, Session, mask_password};

use crate::cache::ResponseCache;
use crate::config::AppConfig;
use crate::rate_limit::RateLimiter;
use crate::store::{self, DynSharedStore, StoreError};

/// Failures that abort startup before the listener binds.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Database initialization failed: {0}")]
    Database(#[from] PostgresError),
    #[error("Shared store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Database engine, shared store, admission controller and response cache.
///
/// Cheap to clone; every clone refers to the same resources.
#[derive(Clone)]
pub struct AppContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: AppConfig,
    database: Database,
    store: DynSharedStore,
    rate_limiter: Arc<RateLimiter>,
    response_cache: Arc<ResponseCache>,
}

impl AppContext {
    /// Validates the configuration, creates the database engine and connects
    /// the shared store. The limiter and the cache are ready when this returns.
    pub async fn initialize(config: AppConfig) -> Result<Self, StartupError> {
        config.validate().map_err(StartupError::Configuration)?;

        let pg_config = config
            .database
            .to_postgres_config()
            .ok_or_else(|| StartupError::Configuration("database.url is required".into()))?;
        let database = Database::connect_lazy(&pg_config)?;
        tracing::info!(url = %mask_password(&pg_config.url), "Database engine created");

        let store = store::connect(&config.redis).await?;
        tracing::info!(backend = store.backend(), "Shared store connected");

        Ok(Self::from_parts(config, database, store))
    }

    /// Assembles a context from already-built resources. The configuration is
    /// taken as is.
    pub fn from_parts(config: AppConfig, database: Database, store: DynSharedStore) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(store.clone(), &config.rate_limit));
        let response_cache = Arc::new(ResponseCache::new(store.clone(), &config.cache));
        tracing::info!(
            rate_limit.enabled = config.rate_limit.enabled,
            rate_limit.threshold = config.rate_limit.threshold,
            rate_limit.window_secs = config.rate_limit.window_secs,
            rate_limit.failure_policy = %config.rate_limit.failure_policy,
            cache.enabled = config.cache.enabled,
            cache.ttl_secs = config.cache.default_ttl_secs,
            "Admission control and response cache ready"
        );

        Self {
            inner: Arc::new(ContextInner {
                config,
                database,
                store,
                rate_limiter,
                response_cache,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn store(&self) -> &DynSharedStore {
        &self.inner.store
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.inner.rate_limiter.clone()
    }

    pub fn response_cache(&self) -> Arc<ResponseCache> {
        self.inner.response_cache.clone()
    }

    /// Closes the store and the database pool.
    pub async fn shutdown(&self) {
        self.inner.store.close().await;
        self.inner.database.close().await;
        tracing::info!("Shared resources released");
    }
}

/// A fresh [`Session`] per request.
///
/// No connection is taken from the pool until the handler first uses it;
/// dropping an uncommitted session rolls back.
#[derive(Debug)]
pub struct DbSession(pub Session);

impl Deref for DbSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.0
    }
}

impl DerefMut for DbSession {
    fn deref_mut(&mut self) -> &mut Session {
        &mut self.0
    }
}

impl<S> FromRequestParts<S> for DbSession
where
    AppContext: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(_parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(DbSession(AppContext::from_ref(state).database().session()))
    }
}
