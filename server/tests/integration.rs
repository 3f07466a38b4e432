//! Integration tests for the HTTP API

mod common;

use std::time::Duration;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use base64::Engine as _;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::*;
use server::config::ServerConfig;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn generate_body() -> Value {
    json!({
        "script": "Welcome to the show.\nThanks for having me.",
        "speakers": ["Alice", "Bob"],
    })
}

#[tokio::test]
async fn test_health_check() {
    let test_app = create_test_app(FakeGenerator::quick());
    for uri in ["/health", "/healthz", "/api/health"] {
        let (status, body) = send(&test_app.router, get(uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["generating"], false);
        assert_eq!(body["backend"], "fake");
    }
}

#[tokio::test]
async fn test_request_id_header() {
    let test_app = create_test_app(FakeGenerator::quick());
    let response = test_app.router.clone().oneshot(get("/health")).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn test_list_voices() {
    let test_app = create_test_app(FakeGenerator::quick());
    let (status, body) = send(&test_app.router, get("/voices")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["Alice", "Bob"]));
}

#[tokio::test]
async fn test_generate_success() {
    let test_app = create_test_app(FakeGenerator::quick());
    let (status, body) = send(&test_app.router, post_json("/generate", generate_body())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "completed");
    assert_eq!(body["sample_rate"], TEST_SAMPLE_RATE);
    assert_eq!(body["duration_ms"], 2500);
    assert_eq!(body["chunks"], 3);
    assert!(body["log"].as_str().unwrap().contains("Generation successful"));

    let wav = base64::engine::general_purpose::STANDARD
        .decode(body["audio_base64"].as_str().unwrap())
        .unwrap();
    assert_eq!(&wav[0..4], b"RIFF");
    assert_eq!(wav.len(), 44 + 250 * 2);

    // The gate is released once the request completes.
    assert!(!test_app.state.gate.is_busy());
}

#[tokio::test]
async fn test_generate_validation_errors() {
    let test_app = create_test_app(FakeGenerator::quick());
    let cases = [
        (json!({"script": "", "speakers": ["Alice"]}), StatusCode::BAD_REQUEST),
        (json!({"script": "Hi", "speakers": []}), StatusCode::BAD_REQUEST),
        (
            json!({"script": "Hi", "speakers": ["Alice", "Bob", "Alice", "Bob", "Alice"]}),
            StatusCode::BAD_REQUEST,
        ),
        (json!({"script": "Hi", "speakers": ["Carol"]}), StatusCode::NOT_FOUND),
        (
            json!({"script": "Hi", "speakers": ["Alice"], "cfg_scale": 3.0}),
            StatusCode::BAD_REQUEST,
        ),
    ];
    for (request, expected) in cases {
        let (status, body) = send(&test_app.router, post_json("/generate", request)).await;
        assert_eq!(status, expected);
        assert_eq!(body["code"], expected.as_u16());
    }
    let (_, metrics) = send(&test_app.router, get("/metrics")).await;
    assert_eq!(metrics["sessions"]["sessions"], 0);
}

#[tokio::test]
async fn test_generate_rejected_while_busy() {
    let test_app = create_test_app(FakeGenerator::quick());
    let _permit = test_app.state.gate.try_acquire().unwrap();

    let (status, body) = send(&test_app.router, post_json("/generate", generate_body())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);
}

#[tokio::test]
async fn test_generate_failure_without_audio() {
    let test_app = create_test_app(FakeGenerator::failing("model exploded"));
    let (status, body) = send(&test_app.router, post_json("/generate", generate_body())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("model exploded"));
}

#[tokio::test]
async fn test_stop_without_session() {
    let test_app = create_test_app(FakeGenerator::quick());
    let (status, body) = send(&test_app.router, post_json("/stop", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], false);
}

#[tokio::test]
async fn test_stop_cancels_running_generation() {
    let test_app = create_test_app(FakeGenerator::endless());
    let router = test_app.router.clone();
    let pending = tokio::spawn(async move { send(&router, post_json("/generate", generate_body())).await });

    for _ in 0..200 {
        if test_app.state.gate.is_busy() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = send(&test_app.router, post_json("/api/stop", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let (status, body) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "cancelled");
    assert!(body["audio_base64"].is_string());
    assert!(body["log"].as_str().unwrap().contains("Generation stopped by user"));

    let (_, metrics) = send(&test_app.router, get("/metrics")).await;
    assert_eq!(metrics["sessions"]["cancelled"], 1);
}

#[tokio::test]
async fn test_upload_voice() {
    let test_app = create_test_app(FakeGenerator::quick());
    let scratch = tempfile::tempdir().unwrap();
    write_voice(scratch.path(), "clip", 1.0);
    let bytes = std::fs::read(scratch.path().join("clip.wav")).unwrap();
    let audio_base64 = base64::engine::general_purpose::STANDARD.encode(bytes);

    let upload = json!({"name": "Carol", "file_name": "carol.wav", "audio_base64": audio_base64});
    let (status, body) = send(&test_app.router, post_json("/voices", upload.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "Carol");
    assert_eq!(body["voices"], json!(["Alice", "Bob", "Carol"]));
    assert!(test_app.voices_dir.path().join("Carol.wav").exists());

    // Usable right away.
    let request = json!({"script": "Hi", "speakers": ["Carol"]});
    let (status, _) = send(&test_app.router, post_json("/generate", request)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&test_app.router, post_json("/voices", upload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upload_voice_rejects_bad_input() {
    let test_app = create_test_app(FakeGenerator::quick());
    let bad_base64 = json!({"name": "X", "file_name": "x.wav", "audio_base64": "%%%"});
    let (status, _) = send(&test_app.router, post_json("/voices", bad_base64)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let not_wav = json!({
        "name": "X",
        "file_name": "x.mp3",
        "audio_base64": base64::engine::general_purpose::STANDARD.encode(b"ID3"),
    });
    let (status, body) = send(&test_app.router, post_json("/voices", not_wav)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Unsupported audio format"));
}

#[tokio::test]
async fn test_upload_voice_accepts_clips_above_default_body_limit() {
    let test_app = create_test_app(FakeGenerator::quick());
    let scratch = tempfile::tempdir().unwrap();
    // 150 s at 8 kHz: 2.4 MB of WAV, 3.2 MB once base64 encoded.
    write_voice(scratch.path(), "long", 150.0);
    let bytes = std::fs::read(scratch.path().join("long.wav")).unwrap();
    assert!(bytes.len() > 2 * 1024 * 1024);
    let audio_base64 = base64::engine::general_purpose::STANDARD.encode(bytes);

    let upload = json!({"name": "Dana", "file_name": "dana.wav", "audio_base64": audio_base64});
    let (status, body) = send(&test_app.router, post_json("/voices", upload)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "Dana");
}

#[tokio::test]
async fn test_upload_voice_over_size_cap_is_json_error() {
    let test_app = create_test_app(FakeGenerator::quick());
    // Decodes to just over 20 MB; the body still fits the route's limit.
    let audio_base64 = "A".repeat(27_962_032);
    let upload = json!({"name": "Huge", "file_name": "huge.wav", "audio_base64": audio_base64});
    let (status, body) = send(&test_app.router, post_json("/voices", upload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
    assert!(body["error"].as_str().unwrap().contains("too large"));
}

#[tokio::test]
async fn test_list_examples() {
    let test_app = create_test_app(FakeGenerator::quick());
    let (status, body) = send(&test_app.router, get("/api/examples")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{
            "name": "interview.txt",
            "num_speakers": 2,
            "script": "Speaker 1: Welcome\nSpeaker 2: Thanks",
        }])
    );
}

#[tokio::test]
async fn test_rate_limit_returns_json_error() {
    let config = ServerConfig {
        rate_limit_per_minute: 1,
        ..test_config()
    };
    let test_app = create_test_app_with(FakeGenerator::quick(), config);

    let (status, _) = send(&test_app.router, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&test_app.router, get("/health")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], 429);
    assert_eq!(body["error"], "Rate limit exceeded");
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let test_app = create_test_app(FakeGenerator::quick());
    send(&test_app.router, post_json("/generate", generate_body())).await;

    let (status, body) = send(&test_app.router, get("/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"]["completed"], 1);
    assert_eq!(body["sessions"]["chunks_streamed"], 3);
    assert_eq!(body["endpoints"]["generate"]["request_count"], 1);
    assert!(body["system"]["memory_total_mb"].is_number());
    assert!(body["timestamp"].is_string());
}
