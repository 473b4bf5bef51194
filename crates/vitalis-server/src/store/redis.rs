//! Redis-backed shared store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool, PoolError};
use redis::{AsyncCommands, RedisError, Script};

use super::{CounterSnapshot, SharedStore, StoreError, StoreResult, bounded};
use crate::config::RedisConfig;

/// Bounded fixed-window counter. A missing key is created at 1 with its expiry
/// in one `SET PX`; an existing key is incremented only while below the limit,
/// otherwise it is returned unchanged with its remaining TTL. Runs atomically on
/// the server, so concurrent callers from any process observe a strict sequence
/// of counts and the stored value never exceeds the limit.
///
/// Returns `{count, ttl_ms, admitted}`.
const INCR_WITHIN_LIMIT: &str = r#"
local window = tonumber(ARGV[1])
local limit = tonumber(ARGV[2])
local current = tonumber(redis.call('GET', KEYS[1]) or 0) or 0
if current == 0 then
    if limit < 1 then
        return {0, window, 0}
    end
    redis.call('SET', KEYS[1], 1, 'PX', window)
    return {1, window, 1}
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], window)
    ttl = window
end
if current < limit then
    return {redis.call('INCR', KEYS[1]), ttl, 1}
end
return {current, ttl, 0}
"#;

/// Pooled Redis client shared by the rate limiter and the response cache.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
    incr_script: Arc<Script>,
}

impl RedisStore {
    /// Creates the pool and performs a `PING` handshake.
    pub async fn connect(config: &RedisConfig) -> StoreResult<Self> {
        tracing::info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connecting to Redis"
        );

        let store = Self::from_pool(build_pool(config)?, config.timeout());
        store.ping().await?;

        tracing::info!("Connected to Redis");
        Ok(store)
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: Pool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            incr_script: Arc::new(Script::new(INCR_WITHIN_LIMIT)),
        }
    }

    async fn connection(&self) -> StoreResult<Connection> {
        self.pool.get().await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to get Redis connection");
            match e {
                PoolError::Timeout(_) => StoreError::Timeout(self.timeout),
                other => StoreError::Connection(other.to_string()),
            }
        })
    }
}

/// Pool whose wait, create and recycle steps share the per-operation bound.
/// Creating it opens no connection.
fn build_pool(config: &RedisConfig) -> StoreResult<Pool> {
    let timeout = config.timeout();
    let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let mut redis_config = deadpool_redis::Config::from_url(config.url());
    redis_config.pool = Some(pool_config);

    redis_config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|e| StoreError::Connection(format!("failed to create Redis pool: {e}")))
}

fn command_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn as_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn incr_within_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> StoreResult<CounterSnapshot> {
        let window_ms = as_millis(window);
        bounded(self.timeout, async {
            let mut conn = self.connection().await?;
            let (count, ttl_ms, admitted): (u64, i64, u8) = self
                .incr_script
                .key(key)
                .arg(window_ms)
                .arg(limit)
                .invoke_async(&mut conn)
                .await
                .map_err(command_error)?;
            Ok(CounterSnapshot {
                count,
                expires_in: Duration::from_millis(ttl_ms.max(0) as u64),
                admitted: admitted == 1,
            })
        })
        .await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        bounded(self.timeout, async {
            let mut conn = self.connection().await?;
            conn.get::<_, Option<Vec<u8>>>(key)
                .await
                .map_err(command_error)
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> StoreResult<()> {
        let ttl_ms = as_millis(ttl);
        bounded(self.timeout, async {
            let mut conn = self.connection().await?;
            conn.pset_ex::<_, _, ()>(key, value, ttl_ms)
                .await
                .map_err(command_error)
        })
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        bounded(self.timeout, async {
            let mut conn = self.connection().await?;
            let _pong: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        self.pool.close();
        tracing::info!("Redis connection pool closed");
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    /// Accepts TCP connections and never writes a byte back.
    async fn silent_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr
    }

    fn silent_config(addr: SocketAddr) -> RedisConfig {
        RedisConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            timeout_ms: 150,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn silent_server_fails_handshake_with_timeout() {
        let config = silent_config(silent_server().await);
        let started = Instant::now();
        let err = RedisStore::connect(&config).await.err().expect("handshake must fail");
        assert!(matches!(err, StoreError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn silent_server_operations_time_out_within_bound() {
        let config = silent_config(silent_server().await);
        let store = RedisStore::from_pool(build_pool(&config).unwrap(), config.timeout());
        let window = Duration::from_secs(60);

        let started = Instant::now();
        let err = store.incr_within_limit("k", window, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)), "{err:?}");
        let err = store.get("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)), "{err:?}");
        let err = store
            .set_with_ttl("k", b"v", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)), "{err:?}");
        // Three bounded calls of 150ms each, plus scheduling slack.
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn unreachable_server_fails_handshake() {
        let config = RedisConfig {
            host: "127.0.0.1".into(),
            port: 1,
            timeout_ms: 200,
            ..Default::default()
        };
        let err = RedisStore::connect(&config).await.err().expect("handshake must fail");
        assert!(matches!(
            err,
            StoreError::Connection(_) | StoreError::Timeout(_)
        ));
    }

    #[test]
    fn millis_are_never_zero() {
        assert_eq!(as_millis(Duration::ZERO), 1);
        assert_eq!(as_millis(Duration::from_secs(2)), 2000);
    }
}
