use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Request id extension, available to handlers and the trace span.
#[derive(Debug, Clone)]
pub struct RequestId(pub HeaderValue);

impl RequestId {
    pub fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or("")
    }
}

/// Preserves an incoming `X-Request-Id` or generates one, and echoes it on the
/// response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let req_id_value = req
        .headers()
        .get(&X_REQUEST_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .or_else(|| HeaderValue::try_from(Uuid::new_v4().to_string()).ok())
        .unwrap_or_else(|| HeaderValue::from_static("unknown"));

    req.extensions_mut().insert(RequestId(req_id_value.clone()));

    let mut res = next.run(req).await;
    res.headers_mut().insert(X_REQUEST_ID.clone(), req_id_value);
    res
}
