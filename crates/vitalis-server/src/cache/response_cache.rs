use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use vitalis_api::ApiError;

use super::entry::CachedResponse;
use super::fingerprint::fingerprint;
use crate::config::CacheConfig;
use crate::store::{DynSharedStore, StoreResult};

static X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// The `Cache-Control` directives this cache acts on.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheDirectives {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub max_age: Option<u64>,
}

impl CacheDirectives {
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut directives = Self::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for token in value.split(',') {
                let token = token.trim().to_ascii_lowercase();
                match token.split_once('=') {
                    Some(("max-age", secs)) => {
                        directives.max_age = secs.trim_matches('"').parse().ok();
                    }
                    _ => match token.as_str() {
                        "no-store" => directives.no_store = true,
                        "no-cache" => directives.no_cache = true,
                        "private" => directives.private = true,
                        _ => {}
                    },
                }
            }
        }
        directives
    }
}

/// Fingerprinted response cache over the shared store.
pub struct ResponseCache {
    store: DynSharedStore,
    key_prefix: String,
    default_ttl: Duration,
    max_body_bytes: usize,
    vary_headers: Vec<HeaderName>,
    bypass_prefixes: Vec<String>,
}

impl ResponseCache {
    pub fn new(store: DynSharedStore, config: &CacheConfig) -> Self {
        let vary_headers = config
            .vary_headers
            .iter()
            .filter_map(|name| match HeaderName::from_bytes(name.trim().as_bytes()) {
                Ok(name) => Some(name),
                Err(_) => {
                    tracing::warn!(header = %name, "ignoring invalid cache vary header");
                    None
                }
            })
            .collect();

        Self {
            store,
            key_prefix: config.key_prefix.trim_end_matches(':').to_string(),
            default_ttl: config.default_ttl(),
            max_body_bytes: config.max_body_bytes,
            vary_headers,
            bypass_prefixes: config
                .bypass_prefixes
                .iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
        }
    }

    /// Only `GET`/`HEAD` outside the bypass prefixes are cached.
    pub fn is_cacheable(&self, method: &Method, path: &str) -> bool {
        if *method != Method::GET && *method != Method::HEAD {
            return false;
        }
        !self.bypass_prefixes.iter().any(|prefix| {
            path == prefix
                || path
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }

    pub fn fingerprint(&self, req: &Request<Body>) -> String {
        fingerprint(req.method(), req.uri(), req.headers(), &self.vary_headers)
    }

    fn key(&self, fingerprint: &str) -> String {
        format!("{}:{}", self.key_prefix, fingerprint)
    }

    /// Reads the entry for `fingerprint`. An entry that no longer decodes is
    /// reported as a miss.
    pub async fn lookup(&self, fingerprint: &str) -> StoreResult<Option<CachedResponse>> {
        let Some(bytes) = self.store.get(&self.key(fingerprint)).await? else {
            return Ok(None);
        };
        match CachedResponse::decode(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!(error = %e, fingerprint, "discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    /// Writes the entry in one store operation.
    pub async fn store(
        &self,
        fingerprint: &str,
        entry: &CachedResponse,
        ttl: Duration,
    ) -> StoreResult<()> {
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode cache entry");
                return Ok(());
            }
        };
        self.store
            .set_with_ttl(&self.key(fingerprint), &bytes, ttl)
            .await
    }

    /// Stores a fresh handler response when it qualifies, and hands it back.
    async fn capture(&self, fingerprint: &str, res: Response) -> Response {
        if !res.status().is_success() || res.headers().contains_key(header::SET_COOKIE) {
            return res;
        }
        let directives = CacheDirectives::parse(res.headers());
        if directives.no_store || directives.private {
            return res;
        }
        let ttl = match directives.max_age {
            Some(0) => return res,
            Some(secs) => Duration::from_secs(secs),
            None => self.default_ttl,
        };

        let (mut parts, body) = res.into_parts();
        match body.size_hint().exact() {
            Some(len) if len <= self.max_body_bytes as u64 => {}
            _ => return Response::from_parts(parts, body),
        }
        let bytes = match axum::body::to_bytes(body, self.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to buffer response body");
                return ApiError::internal("Failed to read response body").into_response();
            }
        };

        if directives.max_age.is_none() {
            if let Ok(value) = HeaderValue::try_from(format!("max-age={}", ttl.as_secs())) {
                parts.headers.insert(header::CACHE_CONTROL, value);
            }
        }

        let entry = CachedResponse::new(parts.status, &parts.headers, &bytes);
        match self.store(fingerprint, &entry, ttl).await {
            Ok(()) => crate::metrics::record_cache_store(),
            Err(e) => {
                crate::metrics::record_store_error("cache");
                tracing::warn!(error = %e, "response cache store failed");
            }
        }

        Response::from_parts(parts, Body::from(bytes))
    }
}

fn mark(res: &mut Response, outcome: &'static str) {
    res.headers_mut()
        .insert(X_CACHE.clone(), HeaderValue::from_static(outcome));
}

/// Response cache middleware. Store failures never fail the request.
pub async fn response_cache_middleware(
    State(cache): State<Arc<ResponseCache>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !cache.is_cacheable(req.method(), req.uri().path()) {
        return next.run(req).await;
    }
    let directives = CacheDirectives::parse(req.headers());
    if directives.no_store {
        return next.run(req).await;
    }

    let fingerprint = cache.fingerprint(&req);
    if !directives.no_cache {
        match cache.lookup(&fingerprint).await {
            Ok(Some(entry)) => {
                crate::metrics::record_cache_hit();
                let mut res = entry.into_response();
                mark(&mut res, "HIT");
                return res;
            }
            Ok(None) => {}
            Err(e) => {
                crate::metrics::record_store_error("cache");
                tracing::warn!(error = %e, "response cache lookup failed");
            }
        }
    }

    crate::metrics::record_cache_miss();
    let res = next.run(req).await;
    let mut res = cache.capture(&fingerprint, res).await;
    mark(&mut res, "MISS");
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, SharedStore};

    fn cache_over(store: MemoryStore) -> ResponseCache {
        ResponseCache::new(Arc::new(store), &CacheConfig::default())
    }

    #[test]
    fn only_safe_methods_outside_bypass_prefixes_are_cacheable() {
        let cache = cache_over(MemoryStore::new());
        assert!(cache.is_cacheable(&Method::GET, "/items"));
        assert!(cache.is_cacheable(&Method::HEAD, "/items"));
        assert!(!cache.is_cacheable(&Method::POST, "/items"));
        assert!(!cache.is_cacheable(&Method::DELETE, "/items"));
        assert!(!cache.is_cacheable(&Method::GET, "/auth"));
        assert!(!cache.is_cacheable(&Method::GET, "/auth/me"));
        assert!(cache.is_cacheable(&Method::GET, "/authors"));
    }

    #[test]
    fn directives_parse_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("No-Cache, max-age=30"),
        );
        headers.append(header::CACHE_CONTROL, HeaderValue::from_static("private"));
        let d = CacheDirectives::parse(&headers);
        assert!(d.no_cache);
        assert!(d.private);
        assert!(!d.no_store);
        assert_eq!(d.max_age, Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn stored_entry_is_identical_until_ttl_expires() {
        let store = MemoryStore::new();
        let cache = cache_over(store.clone());
        let entry = CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), b"text/plain".to_vec())],
            body: b"hello".to_vec(),
        };

        cache.store("fp", &entry, Duration::from_secs(30)).await.unwrap();
        assert_eq!(cache.lookup("fp").await.unwrap(), Some(entry));
        assert_eq!(store.keys_with_prefix("vitalis:cache:"), vec!["vitalis:cache:fp"]);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(cache.lookup("fp").await.unwrap(), None);
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("vitalis:cache:fp", b"\xc1", Duration::from_secs(5))
            .await
            .unwrap();
        let cache = cache_over(store);
        assert_eq!(cache.lookup("fp").await.unwrap(), None);
    }
}
