//! End-to-end tests for the defense pipeline through the router.
//!
//! Tests cover:
//! - Stage order (size before origin before rate limit before body screening)
//! - Payload limits on declared and undeclared lengths
//! - Origin and referer checks
//! - Rate limiting with Retry-After and X-RateLimit headers
//! - JSON and form body screening and free-text cleanup
//! - Exempt operational endpoints
//! - One log line per rejection

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use menu_guard_core::api::{build_router, AppState};
use menu_guard_core::config::DefenseConfig;
use menu_guard_core::middleware::{DefensePipeline, LocalRateLimiter, RateLimitPolicy};
use menu_guard_core::telemetry::MetricsRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

mod common;
use common::CapturedLogs;

const HOST: &str = "menu.example.com";
const MIB: usize = 1024 * 1024;

// ============================================================================
// Helpers
// ============================================================================

fn app_with(config: DefenseConfig) -> Router {
    let pipeline = DefensePipeline::new(&config, Arc::new(LocalRateLimiter::without_sweeper()), None)
        .expect("valid defense config");
    let routes = Router::new().route(
        "/api/venues",
        post(|body: String| async move { body }).get(|| async { "venues" }),
    );

    build_router(AppState::new(Arc::new(pipeline), MetricsRegistry::disabled()), routes)
}

fn app() -> Router {
    app_with(DefenseConfig::default())
}

fn json_request(body: impl Into<String>) -> Request<Body> {
    let body = body.into();
    Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, format!("https://{HOST}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

fn form_request(body: &'static str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, format!("https://{HOST}"))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Size
// ============================================================================

#[tokio::test]
async fn test_declared_oversize_rejected() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, format!("https://{HOST}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, MIB + 1)
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let body = body_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(body["error"]["message"], "JSON payload too large (max 1MB)");
}

#[tokio::test]
async fn test_body_at_exact_limit_admitted() {
    let body = format!("\"{}\"", "a".repeat(MIB - 2));
    assert_eq!(body.len(), MIB);

    let response = app().oneshot(json_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_undeclared_oversize_capped_while_buffering() {
    let body = format!("\"{}\"", "a".repeat(MIB));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, format!("https://{HOST}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_malformed_content_length_rejected() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, format!("https://{HOST}"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, "12abc")
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "MALFORMED_DECLARED_SIZE");
}

#[tokio::test]
async fn test_size_checked_before_origin() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, "https://evil.example")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, 2 * MIB)
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

// ============================================================================
// Origin
// ============================================================================

#[tokio::test]
async fn test_foreign_origin_rejected() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, "https://evil.example")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, 2)
        .body(Body::from("{}"))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Invalid origin");
}

#[tokio::test]
async fn test_referer_from_same_host_accepted() {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::REFERER, format!("https://{HOST}/admin/items?token=abc"))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, 2)
        .body(Body::from("{}"))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_origin_and_referer_rejected() {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_safe_methods_skip_origin_check() {
    let request = Request::builder()
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[tokio::test]
async fn test_rate_limit_rejects_after_max() {
    let mut config = DefenseConfig::default();
    config.policies.api = RateLimitPolicy::new(2, Duration::from_secs(60), "api");
    let app = app_with(config);

    let request = || {
        Request::builder()
            .uri("/api/venues")
            .header(header::HOST, HOST)
            .header("x-forwarded-for", "203.0.113.7")
            .body(Body::empty())
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["X-RateLimit-Limit"], "2");
    assert_eq!(first.headers()["X-RateLimit-Remaining"], "1");

    let second = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["X-RateLimit-Remaining"], "0");

    let third = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = third.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));

    let body = body_json(third).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(body["error"]["retry_after_secs"], retry_after);
}

#[tokio::test]
async fn test_rate_limit_is_per_client() {
    let mut config = DefenseConfig::default();
    config.policies.api = RateLimitPolicy::new(1, Duration::from_secs(60), "api");
    let app = app_with(config);

    let from = |ip: &'static str| {
        Request::builder()
            .uri("/api/venues")
            .header(header::HOST, HOST)
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(app.clone().oneshot(from("198.51.100.1")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(app.clone().oneshot(from("198.51.100.2")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        app.clone().oneshot(from("198.51.100.1")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_unrouted_paths_not_rate_limited() {
    let mut config = DefenseConfig::default();
    config.policies.api = RateLimitPolicy::new(1, Duration::from_secs(60), "api");
    let pipeline = DefensePipeline::new(&config, Arc::new(LocalRateLimiter::without_sweeper()), None).unwrap();
    let routes = Router::new().route("/static/logo", get(|| async { "logo" }));
    let app = build_router(AppState::new(Arc::new(pipeline), MetricsRegistry::disabled()), routes);

    for _ in 0..3 {
        let request = Request::builder().uri("/static/logo").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(request).await.unwrap().status(), StatusCode::OK);
    }
}

// ============================================================================
// Body Screening
// ============================================================================

#[tokio::test]
async fn test_script_in_json_rejected() {
    let body = json!({"name": "<script>alert(1)</script>"}).to_string();
    let response = app().oneshot(json_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "DANGEROUS_INPUT_DETECTED");
    assert_eq!(body["error"]["message"], "Invalid input");
}

#[tokio::test]
async fn test_nested_event_handler_rejected() {
    let body = json!({"items": [{"name": "Soup", "image": "x\" onerror=\"steal()"}]}).to_string();
    let response = app().oneshot(json_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_json_rejected() {
    let response = app().oneshot(json_request("{\"name\": ")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "INVALID_JSON");
}

#[tokio::test]
async fn test_free_text_cleaned_and_forwarded() {
    let body = json!({"name": "Pesto", "description": "<b>Fresh</b>   basil"}).to_string();
    let response = app().oneshot(json_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = body_json(response).await;
    assert_eq!(echoed["name"], "Pesto");
    assert_eq!(echoed["description"], "Fresh basil");
}

#[tokio::test]
async fn test_clean_body_forwarded_unchanged() {
    let body = r#"{"name":"Margherita","price":12.5,"tags":["vegetarian"]}"#;
    let response = app().oneshot(json_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], body.as_bytes());
}

#[tokio::test]
async fn test_script_in_form_field_rejected() {
    let response = app().oneshot(form_request("x=<script>alert(1)</script>")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "DANGEROUS_INPUT_DETECTED");
}

#[tokio::test]
async fn test_percent_encoded_script_in_form_rejected() {
    let response = app()
        .oneshot(form_request("name=Soup&image=%22+onerror%3D%22steal()"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_form_free_text_cleaned_and_forwarded() {
    let response = app()
        .oneshot(form_request("name=Pesto&description=%3Cb%3EFresh%3C%2Fb%3E+basil"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"name=Pesto&description=Fresh+basil");
}

#[tokio::test]
async fn test_clean_form_forwarded_unchanged() {
    let body = "name=Margherita&price=12.5";
    let response = app().oneshot(form_request(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], body.as_bytes());
}

// ============================================================================
// Logging
// ============================================================================

#[tokio::test]
async fn test_rejection_logged_once() {
    let (logs, _guard) = CapturedLogs::install(tracing::Level::WARN);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header(header::ORIGIN, "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    assert_eq!(logs.count("Request rejected"), 1, "{}", logs.contents());
}

// ============================================================================
// Exempt Paths
// ============================================================================

#[tokio::test]
async fn test_health_exempt_from_pipeline() {
    let mut config = DefenseConfig::default();
    config.policies.api = RateLimitPolicy::new(1, Duration::from_secs(60), "api");
    let app = app_with(config);

    for _ in 0..3 {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["rate_limit"]["distributed"].is_null());
    }
}

#[tokio::test]
async fn test_request_id_echoed_on_rejection() {
    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/venues")
        .header(header::HOST, HOST)
        .header("x-request-id", "req-123")
        .body(Body::empty())
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers()["x-request-id"], "req-123");
}
