pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod rate_limit;
pub mod server;
pub mod store;

pub use cache::{CachedResponse, ResponseCache};
pub use config::{
    AppConfig, CacheConfig, DatabaseConfig, FailurePolicy, RateLimitConfig, RedisConfig,
    ServerConfig,
};
pub use context::{AppContext, DbSession, StartupError};
pub use observability::{init_tracing, shutdown_tracing};
pub use rate_limit::{Admission, Quota, RateLimiter};
pub use server::{RouterParts, ServerBuilder, VitalisServer, build_app};
pub use store::{
    CounterSnapshot, DynSharedStore, MemoryStore, RedisStore, SharedStore, StoreError,
};
