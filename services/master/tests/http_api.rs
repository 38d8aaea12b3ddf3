//! HTTP surface of the master, driven through the router.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use common::Cluster;
use corral_master::api::{create_router, STREAM_ID_HEADER};
use serde_json::{json, Value};
use tower::ServiceExt;

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health() {
    let cluster = Cluster::start();
    let app = create_router(cluster.master.clone());

    let response = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "corral-master");
}

#[tokio::test]
async fn test_health_after_master_exit() {
    let cluster = Cluster::start();
    let master = cluster.master.clone();
    cluster.stop().await.unwrap();

    let response = create_router(master)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_operator_get_health() {
    let cluster = Cluster::start();
    let response = create_router(cluster.master.clone())
        .oneshot(post("/api/v1/operator", json!({"type": "GET_HEALTH"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body, json!({"type": "GET_HEALTH", "healthy": true}));
}

#[tokio::test]
async fn test_missing_content_type_is_unsupported() {
    let cluster = Cluster::start();
    let request = Request::post("/api/v1/operator")
        .body(Body::from(r#"{"type": "GET_HEALTH"}"#))
        .unwrap();
    let response = create_router(cluster.master.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
}

#[tokio::test]
async fn test_operator_call_without_type() {
    let cluster = Cluster::start();
    let response = create_router(cluster.master.clone())
        .oneshot(post("/api/v1/operator", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json_body(response).await;
    assert_eq!(body["status"], 400);
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_scheduler_subscribe_streams_events() {
    let cluster = Cluster::start();
    let response = create_router(cluster.master.clone())
        .oneshot(post(
            "/api/v1/scheduler",
            json!({
                "type": "SUBSCRIBE",
                "subscribe": {"framework_info": {"name": "batch", "roles": ["web"]}}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key(STREAM_ID_HEADER));
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-ndjson"
    );
}

#[tokio::test]
async fn test_scheduler_call_with_bad_stream_id() {
    let cluster = Cluster::start();
    let request = Request::post("/api/v1/scheduler")
        .header(header::CONTENT_TYPE, "application/json")
        .header(STREAM_ID_HEADER, "not-a-uuid")
        .body(Body::from(json!({"type": "REVIVE"}).to_string()))
        .unwrap();
    let response = create_router(cluster.master.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
