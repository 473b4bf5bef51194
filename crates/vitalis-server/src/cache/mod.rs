//! Shared response cache.
//!
//! ```text
//! GET/HEAD → fingerprint(method, path, query, vary headers)
//!          → store GET prefix:fingerprint ── hit ──→ replay (X-Cache: HIT)
//!                      │ miss
//!                      ↓
//!                   handler → 2xx, bounded body, no cookie → store PX ttl
//! ```
//!
//! Entries are written in one `SET ... PX` so readers never see a partial
//! entry. The cache is fail-open: store errors degrade to running the handler.

pub mod entry;
pub mod fingerprint;
pub mod response_cache;

pub use entry::CachedResponse;
pub use fingerprint::fingerprint;
pub use response_cache::{CacheDirectives, ResponseCache, response_cache_middleware};
