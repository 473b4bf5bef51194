//! Shared key-value store used by admission control and the response cache.
//!
//! ## Backends
//!
//! - **Redis** (`RedisStore`): one pooled connection set per process, shared
//!   across every instance of the service. Counter updates run as a server-side
//!   script, so admission is consistent across processes.
//! - **Memory** (`MemoryStore`): a DashMap for single-instance deployments and
//!   tests. Atomic within the process only.
//!
//! Both the rate limiter and the cache hold the same `Arc<dyn SharedStore>`;
//! neither owns its lifecycle. It is closed once, by the application context,
//! at shutdown.

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::config::RedisConfig;

/// Shared, reference-counted store handle.
pub type DynSharedStore = Arc<dyn SharedStore>;

/// Errors from the shared store. All of them mean "the store could not
/// answer"; callers apply their own fail-open/fail-closed policy.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Could not obtain a connection (handshake, pool creation, pool wait).
    #[error("store connection error: {0}")]
    Connection(String),

    /// The store answered with an error.
    #[error("store command error: {0}")]
    Command(String),

    /// The operation did not finish within the configured bound.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// State of a counter after one bounded increment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Stored value; 1 for a freshly created counter, never above the limit.
    pub count: u64,
    /// Time until the counter expires.
    pub expires_in: Duration,
    /// Whether this call incremented the counter. `false` means the limit was
    /// already reached and the stored value was left untouched.
    pub admitted: bool,
}

/// Atomic primitives the admission controller and the response cache need.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Increments the counter at `key` while it is below `limit`. A missing key
    /// is created with value 1 and expiry `window` in the same atomic step; a
    /// counter at `limit` is left as is and reported with `admitted: false`.
    async fn incr_within_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> StoreResult<CounterSnapshot>;

    /// Reads a value. Expired keys are absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Writes a value with a time-to-live. The write is a single operation:
    /// readers see either the previous value or the whole new one.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()>;

    /// Checks that the store answers.
    async fn ping(&self) -> StoreResult<()>;

    /// Releases connections. Called once at shutdown.
    async fn close(&self) {}

    /// Backend name for logs and readiness output.
    fn backend(&self) -> &'static str;
}

/// Connects the store selected by configuration.
///
/// With Redis enabled, an unreachable server is an error: the process must not
/// start serving with admission control silently downgraded to local state.
pub async fn connect(config: &RedisConfig) -> StoreResult<DynSharedStore> {
    if !config.enabled {
        tracing::warn!(
            "Redis disabled, using in-process store; rate limits and cache are per instance"
        );
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = RedisStore::connect(config).await?;
    Ok(Arc::new(store))
}

/// Runs `fut`, turning an elapsed `timeout` into [`StoreError::Timeout`].
pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_redis_yields_memory_store() {
        let config = RedisConfig {
            enabled: false,
            ..Default::default()
        };
        let store = connect(&config).await.unwrap();
        assert_eq!(store.backend(), "memory");
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn bounded_reports_timeout() {
        let err = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
    }
}
