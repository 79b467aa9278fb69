//! HTTP routing tests for hiomi-web
//!
//! Requests go through the router with `oneshot`; upload, results and
//! inference calls land on an in-process mock backend.

use axum::body::Body;
use axum::extract::{Multipart, Query};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hiomi_client::HiomiClient;
use hiomi_common::ServiceConfig;
use hiomi_web::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "hiomi-test-boundary";

async fn text_fields(mut multipart: Multipart) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let value = match field.file_name() {
            Some(file_name) => file_name.to_string(),
            None => field.text().await.unwrap(),
        };
        fields.insert(name, value);
    }
    fields
}

/// Uploads of files named `slow*` take this long
const SLOW_UPLOAD: Duration = Duration::from_millis(500);

async fn mock_upload(multipart: Multipart) -> Response {
    let fields = text_fields(multipart).await;
    let filename = fields.get("file").cloned().unwrap_or_default();
    if filename.starts_with("slow") {
        tokio::time::sleep(SLOW_UPLOAD).await;
    }
    (StatusCode::OK, format!("Received {filename}")).into_response()
}

async fn mock_results(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    Json(json!({
        "filename": query.get("filename"),
        "userId": query.get("userId"),
        "contentType": "image/png",
        "size": 4,
        "result": {
            "prediction": "pneumonia",
            "confidence": 0.87,
            "probabilities": { "pneumonia": 0.87, "normal": 0.1, "other": 0.03 }
        }
    }))
}

async fn mock_process(multipart: Multipart) -> Response {
    let fields = text_fields(multipart).await;
    match fields.get("model").map(String::as_str) {
        Some("bad") => (StatusCode::UNPROCESSABLE_ENTITY, "Unknown model").into_response(),
        _ => Json(json!({ "text": format!("{}: Pneumonia", fields.get("image").cloned().unwrap_or_default()) }))
            .into_response(),
    }
}

/// Start the mock backend and return its base URL
async fn start_backend() -> String {
    let app = Router::new()
        .route("/upload", post(mock_upload))
        .route("/results", get(mock_results))
        .route("/process_image", post(mock_process));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn test_state(base: &str) -> AppState {
    let config = ServiceConfig {
        api_url: base.to_string(),
        upload_url: base.to_string(),
        result_url: base.to_string(),
        poll_interval: Duration::from_millis(20),
        poll_max_attempts: 10,
        result_push: false,
        http_timeout: Duration::from_secs(5),
        ..ServiceConfig::default()
    };
    AppState::new(HiomiClient::new(config).unwrap())
}

/// Port nobody is listening on
async fn closed_base() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    base
}

fn multipart_request(uri: &str, file: Option<(&str, &str, &[u8])>, fields: &[(&str, &str)]) -> Request<Body> {
    let mut body = Vec::new();
    if let Some((name, filename, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    for (name, value) in fields {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, body)
}

async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(state, Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap())
}

const PNG: &[u8] = &[0x89, 0x50, 0x4e, 0x47];

#[tokio::test]
async fn test_health_endpoint() {
    let state = test_state(&closed_base().await);
    let (status, json) = get_json(&state, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["module"], "hiomi-web");
    assert!(json["uptime_seconds"].is_u64());
}

#[tokio::test]
async fn test_proxy_forwards_to_backend() {
    let state = test_state(&start_backend().await);
    let request = multipart_request("/api/process_image", Some(("image", "xray1.png", PNG)), &[("model", "1")]);

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["text"], "xray1.png: Pneumonia");
}

#[tokio::test]
async fn test_proxy_passes_backend_error_through() {
    let state = test_state(&start_backend().await);
    let request = multipart_request("/api/process_image", Some(("image", "xray1.png", PNG)), &[("model", "bad")]);

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body, b"Unknown model");
}

#[tokio::test]
async fn test_proxy_unreachable_backend_is_internal_error() {
    let state = test_state(&closed_base().await);
    let request = multipart_request("/api/process_image", Some(("image", "xray1.png", PNG)), &[("model", "1")]);

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, b"Internal Server Error");
}

#[tokio::test]
async fn test_cors_preflight_allowed() {
    let state = test_state(&closed_base().await);
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/process_image")
        .header("origin", "http://localhost:3000")
        .header("access-control-request-method", "POST")
        .header("access-control-request-headers", "content-type")
        .body(Body::empty())
        .unwrap();

    let response = build_router(state).oneshot(request).await.unwrap();

    assert!(response.status().is_success());
    assert!(response.headers().contains_key("access-control-allow-origin"));
    assert!(response.headers().contains_key("access-control-allow-methods"));
}

#[tokio::test]
async fn test_detection_starts_idle_and_cancel_is_idempotent() {
    let state = test_state(&closed_base().await);

    let (status, json) = get_json(&state, "/api/detect/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "state": "idle" }));

    for _ in 0..2 {
        let request = Request::builder()
            .method("DELETE")
            .uri("/api/detect")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
}

#[tokio::test]
async fn test_detection_rejects_unsupported_file() {
    let state = test_state(&closed_base().await);
    let request = multipart_request("/api/detect", Some(("image", "notes.txt", b"hello")), &[]);

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "REJECTED_FILE");
}

#[tokio::test]
async fn test_detection_requires_image() {
    let state = test_state(&closed_base().await);
    let request = multipart_request("/api/detect", None, &[("model", "1")]);

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_detection_upload_unreachable() {
    let state = test_state(&closed_base().await);
    let request = multipart_request("/api/detect", Some(("image", "xray1.png", PNG)), &[]);

    let (status, body) = send(&state, request).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert!(json["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("Cannot connect to upload service."));
}

#[tokio::test]
async fn test_detection_resolves_through_polling() {
    let state = test_state(&start_backend().await);
    let request = multipart_request(
        "/api/detect",
        Some(("image", "xray1.png", PNG)),
        &[("model", "2"), ("userId", "42")],
    );

    let (status, body) = send(&state, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let accepted: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(accepted["pending"], json!({ "userId": "42", "filename": "xray1.png" }));
    assert_eq!(accepted["upload_status"], 200);
    assert_eq!(accepted["message"], "Received xray1.png");

    let mut resolved = None;
    for _ in 0..100 {
        let (_, json) = get_json(&state, "/api/detect/state").await;
        if json["state"] == "resolved" {
            resolved = Some(json);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let resolved = resolved.expect("detection resolved");
    assert_eq!(resolved["result"]["filename"], "xray1.png");
    assert_eq!(resolved["result"]["result"]["prediction"], "pneumonia");
    assert_eq!(resolved["summary"]["headline"], "Pneumonia Likely");
    assert_eq!(resolved["summary"]["confidence_percent"], 87);
}

#[tokio::test]
async fn test_detection_events_stream_current_state() {
    let state = test_state(&closed_base().await);
    let request = Request::builder()
        .uri("/api/detect/events")
        .body(Body::empty())
        .unwrap();

    let response = build_router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/event-stream"));

    let mut body = response.into_body();
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("first event within 2s")
        .unwrap()
        .unwrap();
    let text = String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap();

    assert!(text.contains("event: state"));
    assert!(text.contains(r#"{"state":"idle"}"#));
}

fn delete_detection() -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri("/api/detect")
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_cancel_during_upload_wins() {
    let state = test_state(&start_backend().await);

    let submit = {
        let state = state.clone();
        tokio::spawn(async move {
            send(&state, multipart_request("/api/detect", Some(("image", "slow.png", PNG)), &[])).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _) = send(&state, delete_detection()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = submit.await.unwrap();
    assert_eq!(status, StatusCode::CONFLICT);
    let json: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "CONFLICT");

    // Nothing was left waiting for the cancelled upload
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_, json) = get_json(&state, "/api/detect/state").await;
    assert_eq!(json, json!({ "state": "idle" }));
}

#[tokio::test]
async fn test_newer_submission_wins_over_slower_upload() {
    let state = test_state(&start_backend().await);

    let first = {
        let state = state.clone();
        tokio::spawn(async move {
            send(&state, multipart_request("/api/detect", Some(("image", "slow-first.png", PNG)), &[])).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, _) = send(&state, multipart_request("/api/detect", Some(("image", "second.png", PNG)), &[])).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = first.await.unwrap();
    assert_eq!(status, StatusCode::CONFLICT);

    let mut resolved = None;
    for _ in 0..100 {
        let (_, json) = get_json(&state, "/api/detect/state").await;
        if json["state"] == "resolved" {
            resolved = Some(json);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let resolved = resolved.expect("detection resolved");
    assert_eq!(resolved["result"]["filename"], "second.png");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_, json) = get_json(&state, "/api/detect/state").await;
    assert_eq!(json["result"]["filename"], "second.png");
}
