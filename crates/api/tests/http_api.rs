//! HTTP surface tests: health, upload -> fileRef, blob serving, mode
//! admin, and the legacy blocking generate adapter.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::*;
use serde_json::json;

#[tokio::test]
async fn healthz_reports_mode_and_storage() {
    let app = build_test_app(Duration::ZERO);

    let response = get(app.router.clone(), "/healthz").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["type"], "system:status");
    assert_eq!(body["mode"], "sdxl-base");
    assert_eq!(body["storage"]["ok"], true);
    assert_eq!(body["ws_clients"], 0);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn upload_returns_file_ref_and_stores_bytes() {
    let app = build_test_app(Duration::ZERO);

    let response = post_multipart(app.router.clone(), "/v1/upload", b"raw image bytes").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let reference = body["fileRef"].as_str().expect("fileRef in response");
    assert_eq!(reference.len(), 32);

    let stored = app.state.filerefs.take(reference).expect("ref resolvable");
    assert_eq!(stored, b"raw image bytes");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn empty_upload_is_rejected() {
    let app = build_test_app(Duration::ZERO);

    let response = post_multipart(app.router.clone(), "/v1/upload", b"").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn unknown_blob_is_404() {
    let app = build_test_app(Duration::ZERO);

    let response = get(app.router.clone(), "/storage/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn generate_then_fetch_blob() {
    let app = build_test_app(Duration::ZERO);

    let response = post_json(
        app.router.clone(),
        "/generate?format=json",
        json!({
            "prompt": "a cat",
            "size": "512x512",
            "steps": 4,
            "cfg": 1.0,
            "seed": 12345678u64,
            "superres": false,
        }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["meta"]["seed"], 12345678);
    let key = body["outputs"][0]["key"].as_str().expect("output key");
    assert_eq!(
        body["outputs"][0]["url"].as_str().unwrap(),
        format!("/storage/{key}")
    );

    // The blob is retrievable by its content key.
    let response = get(app.router.clone(), &format!("/storage/{key}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "image/png"
    );
    assert_eq!(body_bytes(response).await, FAKE_PNG);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn generate_is_idempotent_on_key() {
    let app = build_test_app(Duration::ZERO);
    let params = json!({ "prompt": "a cat", "seed": 42u64 });

    let first = body_json(
        post_json(app.router.clone(), "/generate?format=json", params.clone()).await,
    )
    .await;
    let second =
        body_json(post_json(app.router.clone(), "/generate?format=json", params).await).await;

    assert_eq!(first["outputs"][0]["key"], second["outputs"][0]["key"]);
    assert_ne!(first["jobId"], second["jobId"]);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn generate_with_expired_ref_is_ref_not_found() {
    let app = build_test_app(Duration::ZERO);

    let response = post_json(
        app.router.clone(),
        "/generate",
        json!({ "prompt": "p", "init_image_ref": "deadbeefdeadbeefdeadbeefdeadbeef" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "RefNotFound");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn generate_validation_failure_is_bad_request() {
    let app = build_test_app(Duration::ZERO);

    let response = post_json(app.router.clone(), "/generate", json!({ "steps": 4 })).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "BadRequest");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn superres_requires_a_live_ref() {
    let app = build_test_app(Duration::ZERO);

    // Unknown ref -> RefNotFound.
    let response = post_json(
        app.router.clone(),
        "/superres",
        json!({ "init_image_ref": "ghost", "magnitude": 2 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    app.state.pool.clone().shutdown_async().await;
}

// ---------------------------------------------------------------------------
// Mode admin
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_modes_includes_defaults() {
    let app = build_test_app(Duration::ZERO);

    let body = body_json(get(app.router.clone(), "/api/modes").await).await;
    assert_eq!(body["default_mode"], "sdxl-base");
    assert_eq!(body["modes"]["sdxl-base"]["model"], "sdxl.safetensors");
    assert_eq!(body["modes"]["turbo"]["default_steps"], 4);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn switch_mode_round_trip() {
    let app = build_test_app(Duration::ZERO);

    let response = post_json(
        app.router.clone(),
        "/api/modes/switch",
        json!({ "mode": "turbo" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "switched");
    assert_eq!(app.state.pool.current_mode().as_deref(), Some("turbo"));

    // Switching again reports already_loaded without a reload.
    let body = body_json(
        post_json(
            app.router.clone(),
            "/api/modes/switch",
            json!({ "mode": "turbo" }),
        )
        .await,
    )
    .await;
    assert_eq!(body["status"], "already_loaded");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn switch_to_unknown_mode_is_404() {
    let app = build_test_app(Duration::ZERO);

    let response = post_json(
        app.router.clone(),
        "/api/modes/switch",
        json!({ "mode": "nope" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["code"], "ModeNotFound");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test]
async fn vram_endpoint_reports_device() {
    let app = build_test_app(Duration::ZERO);

    let body = body_json(get(app.router.clone(), "/api/vram").await).await;
    assert_eq!(body["data"]["device"], "FakeGPU 9000");
    assert_eq!(body["data"]["total_mb"], 8 * 1024);

    app.state.pool.clone().shutdown_async().await;
}
