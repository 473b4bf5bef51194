use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::DefaultBodyLimit,
    http::Request,
    middleware::{Next, from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use vitalis_api::ApiError;

use crate::{
    auth::{self, AUTH_PREFIX},
    cache::response_cache_middleware,
    context::AppContext,
    handlers, metrics,
    middleware::{self as app_middleware, RequestId},
    rate_limit::rate_limit_middleware,
};

/// Upper bound on flushing cut-off responses after the grace period.
const CUT_OFF_FLUSH: Duration = Duration::from_millis(500);

/// Routers mounted behind admission control and the response cache.
pub struct RouterParts {
    /// Application routes.
    pub routes: Router<AppContext>,
    /// Nested at `/auth`.
    pub auth: Router<AppContext>,
}

impl Default for RouterParts {
    fn default() -> Self {
        Self {
            routes: Router::new(),
            auth: auth::placeholder_router(),
        }
    }
}

pub fn build_app(ctx: &AppContext, parts: RouterParts) -> Router {
    let cfg = ctx.config();

    let mut protected = Router::new()
        .nest(AUTH_PREFIX, parts.auth)
        .merge(parts.routes);
    // Later layers wrap earlier ones: admission runs before the cache.
    if cfg.cache.enabled {
        protected = protected.layer(from_fn_with_state(
            ctx.response_cache(),
            response_cache_middleware,
        ));
    }
    if cfg.rate_limit.enabled {
        protected = protected.layer(from_fn_with_state(
            ctx.rate_limiter(),
            rate_limit_middleware,
        ));
    }

    Router::new()
        // Health endpoints, outside admission and cache
        .route("/", get(handlers::root))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        .merge(protected)
        // Middleware stack (outermost last: body limit -> cors -> request id -> trace -> metrics)
        .layer(from_fn(metrics::track_http))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<RequestId>()
                        .map(|id| id.as_str().to_string())
                        .unwrap_or_default();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record("http.status_code", res.status().as_u16());
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(from_fn(app_middleware::request_id))
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(cfg.server.body_limit_bytes))
        .with_state(ctx.clone())
}

/// Builds a [`VitalisServer`] from an initialized [`AppContext`].
///
/// Requiring the context up front means the limiter and the cache exist before
/// any listener can be bound.
pub struct ServerBuilder {
    addr: SocketAddr,
    context: AppContext,
    parts: RouterParts,
}

impl ServerBuilder {
    pub fn new(context: AppContext) -> Self {
        Self {
            addr: context.config().addr(),
            context,
            parts: RouterParts::default(),
        }
    }

    /// Adds application routes. May be called more than once.
    pub fn with_routes(mut self, routes: Router<AppContext>) -> Self {
        self.parts.routes = self.parts.routes.merge(routes);
        self
    }

    /// Replaces the placeholder `/auth` router.
    pub fn with_auth_router(mut self, router: Router<AppContext>) -> Self {
        self.parts.auth = router;
        self
    }

    pub fn build(self) -> VitalisServer {
        let app = build_app(&self.context, self.parts);
        VitalisServer {
            addr: self.addr,
            grace: self.context.config().shutdown_grace(),
            app,
            context: self.context,
        }
    }
}

pub struct VitalisServer {
    addr: SocketAddr,
    grace: Duration,
    app: Router,
    context: AppContext,
}

impl VitalisServer {
    /// Binds the configured address and serves until Ctrl-C or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serves on `listener` until `signal` resolves, then drains in-flight
    /// requests for at most the configured grace period and releases the
    /// shared resources.
    ///
    /// Requests still running when the grace period ends are cut off with a
    /// 503 before the pools close, so no handler observes a closed pool.
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        tracing::info!("listening on {}", local_addr);

        let (cut_off, cut_off_rx) = watch::channel(false);
        let app = self
            .app
            .layer(from_fn(move |req: Request<Body>, next: Next| {
                let cut_off = cut_off_rx.clone();
                abort_on_cut_off(cut_off, req, next)
            }));

        let stopping = Arc::new(Notify::new());
        let trigger = stopping.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            signal.await;
            trigger.notify_one();
        })
        .into_future();
        tokio::pin!(server);

        let result = tokio::select! {
            res = &mut server => res,
            _ = stopping.notified() => {
                match tokio::time::timeout(self.grace, &mut server).await {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::warn!(
                            grace_secs = self.grace.as_secs(),
                            "in-flight requests still running after grace period, cutting off"
                        );
                        cut_off.send_replace(true);
                        // Let cut-off responses flush before the pools close.
                        let _ = tokio::time::timeout(CUT_OFF_FLUSH, &mut server).await;
                        Ok(())
                    }
                }
            }
        };

        self.context.shutdown().await;
        result?;
        Ok(())
    }
}

/// Runs the request unless shutdown cuts it off first. Checked before the
/// handler on every poll, so a cut-off request is dropped at its next await.
/// A dropped sender counts as a cut-off.
async fn abort_on_cut_off(
    mut cut_off: watch::Receiver<bool>,
    req: Request<Body>,
    next: Next,
) -> Response {
    tokio::select! {
        biased;
        _ = async { let _ = cut_off.wait_for(|cut| *cut).await; } => {
            ApiError::service_unavailable("Server is shutting down", None).into_response()
        }
        res = next.run(req) => res,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
