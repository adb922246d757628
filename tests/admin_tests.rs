//! Admin facade endpoints driven through the router without a listener.

mod common;

use axum::body::Body;
use axum::Router;
use common::{service, Harness};
use gateway_service_cache::admin::{AdminRouter, AdminState};
use gateway_service_cache::ServiceId;
use http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    AdminRouter::create_router(AdminState { cache: h.cache.clone() })
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn count_reports_size_and_catch_all() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();
    h.cache.cache(service(2, "/*", 1)).unwrap();

    let (status, body) = send(router(&h), get("/services/count")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "size": 2, "has_catch_all": true }));
}

#[tokio::test]
async fn get_service_returns_view_or_not_found() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();

    let (status, body) = send(router(&h), get("/services/1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"]["id"], json!(1));
    assert_eq!(body["enabled_for_resolution"], json!(true));
    assert!(body["disabled_reason"].is_null());
    assert!(body["policy_version"].is_string());

    let (status, body) = send(router(&h), get("/services/42")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], json!("not_found"));
}

#[tokio::test]
async fn services_by_uri_lists_matches() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();
    h.cache.cache(service(2, "/users", 1)).unwrap();

    let (status, body) = send(router(&h), get("/services?uri=/orders")).await;
    assert_eq!(status, StatusCode::OK);
    let services = body.as_array().unwrap();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0]["id"], json!(1));
}

#[tokio::test]
async fn resolve_endpoint_matches_request_attributes() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();

    let (status, body) = send(router(&h), post_json("/resolve", &json!({ "path": "/orders", "method": "GET" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["matched"], json!(true));
    assert_eq!(body["service"]["id"], json!(1));

    let (_, body) = send(router(&h), post_json("/resolve", &json!({ "path": "/missing" }))).await;
    assert_eq!(body["matched"], json!(false));
    assert!(body["service"].is_null());

    let (_, body) = send(
        router(&h),
        post_json("/resolve?service_id=2", &json!({ "path": "/orders" })),
    )
    .await;
    assert_eq!(body["matched"], json!(false));
}

#[tokio::test]
async fn check_resolution_rejects_conflicts() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();

    let clashing = serde_json::to_value(service(2, "/orders", 1)).unwrap();
    let (status, body) = send(router(&h), post_json("/services/check-resolution", &clashing)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], json!("resolution_conflict"));
    assert_eq!(body["error"]["conflicts"][0]["criterion"], json!("uri"));
    assert_eq!(body["error"]["conflicts"][0]["competing_service_id"], json!(1));

    let distinct = serde_json::to_value(service(3, "/users", 1)).unwrap();
    let (status, body) = send(router(&h), post_json("/services/check-resolution", &distinct)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "service_id": 3, "conflicts": 0 }));
}

#[tokio::test]
async fn statistics_endpoints_report_counters() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();

    let stats = h.cache.statistics(ServiceId(1)).unwrap();
    stats.record_request();
    stats.record_request();
    stats.record_completed();

    let (status, body) = send(router(&h), get("/services/1/statistics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requests"], json!(2));
    assert_eq!(body["completed"], json!(1));

    let (status, body) = send(router(&h), get("/services/statistics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);

    let (status, _) = send(router(&h), get("/services/9/statistics")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn publish_commits_only_conflict_free_services() {
    let h = Harness::new();
    h.cache.cache(service(1, "/orders", 1)).unwrap();

    let clashing = serde_json::to_value(service(2, "/orders", 1)).unwrap();
    let (status, body) = send(router(&h), post_json("/services", &clashing)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["type"], json!("resolution_conflict"));
    assert!(h.store.is_empty());

    let distinct = serde_json::to_value(service(3, "/users", 1)).unwrap();
    let (status, body) = send(router(&h), post_json("/services", &distinct)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], json!(3));
    assert_eq!(body["version"], json!(1));
    assert_eq!(h.store.len(), 1);

    let (_, body) = send(router(&h), post_json("/resolve", &json!({ "path": "/users" }))).await;
    assert_eq!(body["service"]["id"], json!(3));
}
