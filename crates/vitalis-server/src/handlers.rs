use axum::{
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
};
use serde::Serialize;
use serde_json::json;
use vitalis_api::{ApiError, ApiResponse};

use crate::context::AppContext;

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    database: CheckResult,
    store: CheckResult,
}

#[derive(Serialize)]
struct CheckResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Liveness. Touches neither the database nor the store.
pub async fn root() -> impl IntoResponse {
    ApiResponse::ok(json!({ "status": "ok" }))
}

/// Readiness: 200 when both the database and the shared store answer.
pub async fn readyz(State(ctx): State<AppContext>) -> impl IntoResponse {
    let (db, store) = tokio::join!(ctx.database().ping(), ctx.store().ping());

    let database = match db {
        Ok(()) => CheckResult {
            ok: true,
            backend: Some("postgres"),
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "readiness: database unavailable");
            CheckResult {
                ok: false,
                backend: Some("postgres"),
                error: Some(e.to_string()),
            }
        }
    };
    let store = match store {
        Ok(()) => CheckResult {
            ok: true,
            backend: Some(ctx.store().backend()),
            error: None,
        },
        Err(e) => {
            tracing::warn!(error = %e, "readiness: shared store unavailable");
            CheckResult {
                ok: false,
                backend: Some(ctx.store().backend()),
                error: Some(e.to_string()),
            }
        }
    };

    let ready = database.ok && store.ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    ApiResponse::new(
        ReadinessResponse {
            status: if ready { "ready" } else { "unavailable" },
            database,
            store,
        },
        status,
    )
    .with_header(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))
}

/// Prometheus text exposition.
pub async fn metrics() -> Result<impl IntoResponse, ApiError> {
    let body = crate::metrics::render_metrics()
        .ok_or_else(|| ApiError::not_found("Metrics are not enabled"))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
