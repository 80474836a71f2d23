//! Router-level contract tests that need no live backing services.
//!
//! The store is created with a lazy pool, so only paths that never reach
//! the database are exercised here.

use std::sync::Arc;

use ai_api_framework::cache::TieredCache;
use ai_api_framework::store::postgres::PgStore;
use ai_api_framework::{build_router, config, AppState};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use tower::ServiceExt;

fn test_router() -> Router {
    let cfg = config::from_lookup(|_| None).unwrap();
    let db = PgStore::connect_lazy(&cfg.database_url).unwrap();
    let state = AppState::new(db, TieredCache::local_only(), cfg).unwrap();
    build_router(Arc::new(state))
}

async fn send(router: Router, req: Request<Body>) -> Response {
    router.oneshot(req).await.unwrap()
}

async fn body_json(resp: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_healthz_carries_security_headers() {
    let resp = send(test_router(), get("/healthz")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["cache-control"], "no-store");
    assert!(headers.contains_key("x-request-id"));
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let req = Request::builder()
        .uri("/healthz")
        .header("x-request-id", "req-abc-123")
        .body(Body::empty())
        .unwrap();
    let resp = send(test_router(), req).await;
    assert_eq!(resp.headers()["x-request-id"], "req-abc-123");
}

#[tokio::test]
async fn test_api_requires_api_key() {
    let resp = send(test_router(), get("/api/v1/balance")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "missing_api_key");
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn test_admin_routes_authenticate_before_scope_check() {
    let resp = send(test_router(), get("/api/v1/admin/users")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(resp).await["error"]["code"], "missing_api_key");
}

#[tokio::test]
async fn test_blank_api_key_counts_as_missing() {
    let req = Request::builder()
        .uri("/api/v1/endpoints")
        .header("api-key", "   ")
        .body(Body::empty())
        .unwrap();
    let resp = send(test_router(), req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let resp = send(test_router(), get("/v2/anything")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(resp).await["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_metrics_exposes_request_counters() {
    let router = test_router();
    let resp = router.clone().oneshot(get("/api/v1/balance")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = router.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["content-type"], "text/plain; version=0.0.4");
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("aiapi_requests_total"));
    assert!(text.contains("status_code=\"401\""));
}
