use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// JSON error body returned to clients: `{"detail": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub detail: String,
}

impl ErrorBody {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

/// High-level API errors mapped to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    /// The client exceeded its admission budget for the current window.
    #[error("Too many requests (retry after {retry_after_secs}s)")]
    TooManyRequests { retry_after_secs: u64 },
    /// A dependency needed to admit or serve the request is down.
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
    pub fn too_many_requests(retry_after_secs: u64) -> Self {
        Self::TooManyRequests { retry_after_secs }
    }
    pub fn service_unavailable(msg: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self::ServiceUnavailable {
            message: msg.into(),
            retry_after_secs,
        }
    }
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        Self::NotImplemented(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the `Retry-After` header, when the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::TooManyRequests { retry_after_secs } => Some(*retry_after_secs),
            ApiError::ServiceUnavailable {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        match self {
            ApiError::NotFound(msg)
            | ApiError::NotImplemented(msg)
            | ApiError::Internal(msg) => ErrorBody::new(msg.clone()),
            ApiError::TooManyRequests { .. } => ErrorBody::new("Too Many Requests"),
            ApiError::ServiceUnavailable { message, .. } => ErrorBody::new(message.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = ApiResponse::new(self.to_body(), self.status_code());
        if let Some(secs) = self.retry_after_secs() {
            response = response.with_header(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response.into_response()
    }
}

/// JSON response with an explicit status and extra headers.
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub value: T,
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

impl<T> ApiResponse<T> {
    pub fn new(value: T, status: StatusCode) -> Self {
        Self {
            value,
            status,
            headers: Vec::new(),
        }
    }

    pub fn ok(value: T) -> Self {
        Self::new(value, StatusCode::OK)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.push((name, value));
        self
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        let body = match serde_json::to_vec(&self.value) {
            Ok(b) => b,
            Err(_) => serde_json::to_vec(&ErrorBody::new("Serialization failure"))
                .unwrap_or_else(|_| b"{}".to_vec()),
        };
        let mut builder = axum::http::Response::builder().status(self.status);
        builder = builder.header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        for (n, v) in self.headers.into_iter() {
            builder = builder.header(n, v);
        }
        builder
            .body(axum::body::Body::from(body))
            .unwrap_or_else(|_| {
                let mut fallback = Response::new(axum::body::Body::from("{}"));
                *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                fallback
            })
    }
}
