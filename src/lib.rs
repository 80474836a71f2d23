//! AI API Framework: metered gateway for Azure AI services.
//!
//! The binary in `main.rs` wires configuration and connections; everything
//! else lives here so integration tests in `tests/` can build the router.

pub mod api;
pub mod cache;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod proxy;
pub mod store;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};

use cache::TieredCache;
use errors::AppError;
use middleware::metrics::GatewayMetrics;
use proxy::azure::CostManagementClient;
use proxy::upstream::UpstreamClient;
use store::postgres::PgStore;

/// Request bodies above this size are rejected before reaching a handler.
pub const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub db: PgStore,
    pub cache: TieredCache,
    pub upstream_client: UpstreamClient,
    /// Present only when Azure service-principal credentials are configured.
    pub cost_client: Option<CostManagementClient>,
    pub config: config::Config,
    pub metrics: GatewayMetrics,
}

impl AppState {
    pub fn new(
        db: PgStore,
        cache: TieredCache,
        config: config::Config,
    ) -> anyhow::Result<Self> {
        let upstream_client = UpstreamClient::new()?;
        let cost_client = config.azure.cost.clone().map(CostManagementClient::new);
        Ok(Self {
            db,
            cache,
            upstream_client,
            cost_client,
            config,
            metrics: GatewayMetrics::new()?,
        })
    }
}

/// The full HTTP surface: probes, metrics and the versioned API.
pub fn build_router(state: Arc<AppState>) -> Router {
    let dashboard_origin =
        std::env::var("DASHBOARD_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            let origin = origin.to_str().unwrap_or("");
            origin == dashboard_origin
                || origin.starts_with("http://localhost:")
                || origin.starts_with("http://127.0.0.1:")
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::auth::API_KEY_HEADER),
            HeaderName::from_static("x-request-id"),
        ]);

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api/v1", api::api_router(state.clone()))
        .fallback(|| async { AppError::NotFound("no such route".into()) })
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(axum::middleware::from_fn(security_headers_middleware))
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> Response {
    match state.db.ping().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

/// Echo the caller's X-Request-Id, or mint one, on every response.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let req_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut resp = next.run(req).await;
    if let Ok(val) = HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn security_headers_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let mut resp = next.run(req).await;
    let headers = resp.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    // tokens travel in query strings
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.remove("server");
    resp
}
