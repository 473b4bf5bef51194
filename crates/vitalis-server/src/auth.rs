//! Mount point for the authentication router.
//!
//! The real provider is supplied through
//! [`ServerBuilder::with_auth_router`](crate::server::ServerBuilder::with_auth_router).
//! Until one is, every `/auth` request answers 501.

use axum::{Router, routing::any};
use vitalis_api::ApiError;

use crate::context::AppContext;

pub const AUTH_PREFIX: &str = "/auth";

async fn not_configured() -> ApiError {
    ApiError::not_implemented("Authentication provider is not configured")
}

pub fn placeholder_router() -> Router<AppContext> {
    Router::new()
        .route("/", any(not_configured))
        .route("/{*rest}", any(not_configured))
}
