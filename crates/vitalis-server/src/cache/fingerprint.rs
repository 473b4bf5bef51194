use axum::http::{HeaderMap, HeaderName, Method, Uri};
use sha2::{Digest, Sha256};

/// Hex SHA-256 over method, path, query and the listed request headers.
///
/// Fields are NUL-separated so adjacent values cannot run together. Absent and
/// empty headers hash differently.
pub fn fingerprint(method: &Method, uri: &Uri, headers: &HeaderMap, vary: &[HeaderName]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(uri.path().as_bytes());
    hasher.update([0u8]);
    hasher.update(uri.query().unwrap_or("").as_bytes());

    for name in vary {
        hasher.update([0u8]);
        hasher.update(name.as_str().as_bytes());
        let mut values = headers.get_all(name).iter().peekable();
        if values.peek().is_none() {
            hasher.update([2u8]);
        }
        for value in values {
            hasher.update([1u8]);
            hasher.update(value.as_bytes());
        }
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, header};

    fn fp(method: Method, uri: &str, headers: &HeaderMap) -> String {
        fingerprint(
            &method,
            &uri.parse().unwrap(),
            headers,
            &[header::ACCEPT, header::AUTHORIZATION],
        )
    }

    #[test]
    fn same_request_same_fingerprint() {
        let h = HeaderMap::new();
        assert_eq!(fp(Method::GET, "/items?page=1", &h), fp(Method::GET, "/items?page=1", &h));
        assert_eq!(fp(Method::GET, "/items", &h).len(), 64);
    }

    #[test]
    fn method_path_and_query_all_count() {
        let h = HeaderMap::new();
        let base = fp(Method::GET, "/items?page=1", &h);
        assert_ne!(base, fp(Method::HEAD, "/items?page=1", &h));
        assert_ne!(base, fp(Method::GET, "/items?page=2", &h));
        assert_ne!(base, fp(Method::GET, "/item?page=1", &h));
    }

    #[test]
    fn only_listed_headers_count() {
        let mut a = HeaderMap::new();
        a.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer alice"));
        let mut b = HeaderMap::new();
        b.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer bob"));
        assert_ne!(fp(Method::GET, "/me", &a), fp(Method::GET, "/me", &b));

        let mut c = a.clone();
        c.insert(header::USER_AGENT, HeaderValue::from_static("curl"));
        assert_eq!(fp(Method::GET, "/me", &a), fp(Method::GET, "/me", &c));
    }

    #[test]
    fn absent_and_empty_headers_differ() {
        let absent = HeaderMap::new();
        let mut empty = HeaderMap::new();
        empty.insert(header::ACCEPT, HeaderValue::from_static(""));
        assert_ne!(fp(Method::GET, "/x", &absent), fp(Method::GET, "/x", &empty));
    }
}
