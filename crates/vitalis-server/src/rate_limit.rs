//! Distributed admission control.
//!
//! A fixed-window counter per (client identity, route), kept entirely in the
//! shared store. The limiter itself holds no per-client state, so any number of
//! instances pointed at the same store enforce one combined limit.
//!
//! ```text
//! request → key = prefix:sha256(client, route)
//!         → count < threshold ? INCR key (expiry = window on first hit)
//!         → incremented ? next : 429 + Retry-After
//! ```
//!
//! The stored count never exceeds the threshold within a live window: rejected
//! requests read the counter and its TTL but leave both untouched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    RequestExt,
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use vitalis_api::ApiError;

use crate::config::{FailurePolicy, RateLimitConfig};
use crate::store::{DynSharedStore, StoreResult};

static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
static X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Remaining budget for an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

impl Quota {
    fn write_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(self.limit));
        headers.insert(
            X_RATELIMIT_REMAINING.clone(),
            HeaderValue::from(self.remaining),
        );
        headers.insert(
            X_RATELIMIT_RESET.clone(),
            HeaderValue::from(ceil_secs(self.reset_after)),
        );
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed(Quota),
    Rejected {
        limit: u64,
        /// Whole seconds until the window resets, in `1..=window`.
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed(_))
    }
}

/// Stateless limiter over the shared store.
pub struct RateLimiter {
    store: DynSharedStore,
    threshold: u64,
    window: Duration,
    key_prefix: String,
    failure_policy: FailurePolicy,
    trust_forwarded_for: bool,
}

impl RateLimiter {
    pub fn new(store: DynSharedStore, config: &RateLimitConfig) -> Self {
        Self {
            store,
            threshold: config.threshold,
            window: config.window(),
            key_prefix: config.key_prefix.trim_end_matches(':').to_string(),
            failure_policy: config.failure_policy,
            trust_forwarded_for: config.trust_forwarded_for,
        }
    }

    /// Store key for a (client, route) pair.
    pub fn key(&self, client: &str, route: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(client.as_bytes());
        hasher.update([0u8]);
        hasher.update(route.as_bytes());
        format!("{}:{}", self.key_prefix, hex::encode(hasher.finalize()))
    }

    /// Counts this request against the (client, route) window.
    ///
    /// Store failures are returned as-is; the caller applies the failure policy.
    pub async fn check(&self, client: &str, route: &str) -> StoreResult<Admission> {
        let key = self.key(client, route);
        let snapshot = self
            .store
            .incr_within_limit(&key, self.window, self.threshold)
            .await?;

        if snapshot.admitted {
            return Ok(Admission::Allowed(Quota {
                limit: self.threshold,
                remaining: self.threshold.saturating_sub(snapshot.count),
                reset_after: snapshot.expires_in,
            }));
        }

        let max_secs = self.window.as_secs().max(1);
        let retry_after = ceil_secs(snapshot.expires_in).clamp(1, max_secs);
        Ok(Admission::Rejected {
            limit: self.threshold,
            retry_after: Duration::from_secs(retry_after),
        })
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

/// Identity a request is counted under: the first `X-Forwarded-For` entry when
/// trusted, otherwise the peer IP.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Route template the request matched (`/items/{id}`), or the raw path.
pub fn route_of(req: &Request<Body>) -> String {
    req.extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string())
}

/// Admission middleware. Runs before the response cache, so cache hits are
/// counted too.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extract_parts::<ConnectInfo<SocketAddr>>()
        .await
        .ok()
        .map(|ConnectInfo(addr)| addr);
    let client = client_identity(req.headers(), peer, limiter.trust_forwarded_for);
    let route = route_of(&req);

    match limiter.check(&client, &route).await {
        Ok(Admission::Allowed(quota)) => {
            crate::metrics::record_admission("allowed");
            let mut res = next.run(req).await;
            quota.write_headers(res.headers_mut());
            res
        }
        Ok(Admission::Rejected { limit, retry_after }) => {
            crate::metrics::record_admission("rejected");
            tracing::debug!(
                client = %client,
                route = %route,
                retry_after_secs = retry_after.as_secs(),
                "rate limit exceeded"
            );
            let mut res = ApiError::too_many_requests(retry_after.as_secs()).into_response();
            let headers = res.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING.clone(), HeaderValue::from(0u64));
            res
        }
        Err(e) => {
            crate::metrics::record_store_error("rate_limit");
            match limiter.failure_policy {
                FailurePolicy::FailOpen => {
                    crate::metrics::record_admission("unchecked");
                    tracing::warn!(error = %e, route = %route, "rate limiter unavailable, admitting (fail-open)");
                    next.run(req).await
                }
                FailurePolicy::FailClosed => {
                    crate::metrics::record_admission("refused");
                    tracing::warn!(error = %e, route = %route, "rate limiter unavailable, rejecting (fail-closed)");
                    ApiError::service_unavailable("Rate limiter unavailable", Some(1)).into_response()
                }
            }
        }
    }
}
