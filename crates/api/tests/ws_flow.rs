//! End-to-end WebSocket scenarios against a live server on an ephemeral
//! port: the control channel's submit/ack/progress/terminal ordering,
//! cancellation, disconnect survival, and error envelopes.

mod common;

use std::time::Duration;

use common::*;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: std::net::SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/v1/ws"))
        .await
        .expect("ws connect");
    ws
}

/// Read frames until the next JSON text frame, skipping pings.
async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON frame"),
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            _ => {}
        }
    }
}

/// Read JSON frames until one matches `type`, skipping others (status
/// pushes, queue broadcasts).
async fn next_of_type(ws: &mut WsStream, wanted: &str) -> Value {
    for _ in 0..50 {
        let frame = next_json(ws).await;
        if frame["type"] == wanted {
            return frame;
        }
    }
    panic!("no {wanted} frame within 50 frames");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_greets_with_system_status() {
    let app = build_test_app(Duration::ZERO);
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    let greeting = next_json(&mut ws).await;
    assert_eq!(greeting["type"], "system:status");
    assert_eq!(greeting["mode"], "sdxl-base");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_generate_emits_ack_then_terminal() {
    let app = build_test_app(Duration::from_millis(40));
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(
        json!({
            "type": "job:submit",
            "id": "corr-1",
            "jobType": "generate",
            "params": {
                "prompt": "a cat",
                "size": "512x512",
                "steps": 4,
                "cfg": 1.0,
                "seed": 12345678u64,
                "superres": false,
            },
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    // Ack first, echoing the correlation id.
    let ack = next_of_type(&mut ws, "job:ack").await;
    assert_eq!(ack["id"], "corr-1");
    let job_id = ack["jobId"].as_str().unwrap().to_string();

    // Then progress frames, then exactly one terminal.
    let mut saw_progress = false;
    let complete = loop {
        let frame = next_json(&mut ws).await;
        match frame["type"].as_str().unwrap_or_default() {
            "job:progress" => {
                assert_eq!(frame["jobId"], job_id.as_str());
                saw_progress = true;
            }
            "job:complete" => break frame,
            "job:error" | "job:cancel" => panic!("unexpected terminal: {frame}"),
            _ => {}
        }
    };
    assert!(saw_progress, "expected at least one progress frame");
    assert_eq!(complete["jobId"], job_id.as_str());
    assert_eq!(complete["meta"]["seed"], 12345678);

    // The output is retrievable over HTTP by its content key.
    let key = complete["outputs"][0]["key"].as_str().unwrap();
    let response = reqwest::get(format!("http://{addr}/storage/{key}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), FAKE_PNG);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_envelope_type_echoes_id() {
    let app = build_test_app(Duration::ZERO);
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(
        json!({ "type": "mystery:op", "id": "corr-9" }).to_string().into(),
    ))
    .await
    .unwrap();

    let error = next_of_type(&mut ws, "job:error").await;
    assert_eq!(error["kind"], "UnknownType");
    assert_eq!(error["id"], "corr-9");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_job_type_is_rejected_without_a_job() {
    let app = build_test_app(Duration::ZERO);
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(
        json!({ "type": "job:submit", "id": "c", "jobType": "mystery", "params": {} })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let error = next_of_type(&mut ws, "job:error").await;
    assert_eq!(error["kind"], "BadRequest");
    assert_eq!(app.state.pool.queue_len(), 0);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_pong() {
    let app = build_test_app(Duration::ZERO);
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(json!({ "type": "ping" }).to_string().into()))
        .await
        .unwrap();
    next_of_type(&mut ws, "pong").await;

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_queued_job_yields_cancel_terminal() {
    let app = build_test_app(Duration::from_millis(300));
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    // First job occupies the worker; second waits in the queue.
    for (corr, prompt) in [("c-run", "running"), ("c-queued", "queued")] {
        ws.send(Message::Text(
            json!({
                "type": "job:submit",
                "id": corr,
                "jobType": "generate",
                "params": { "prompt": prompt, "seed": 1u64 },
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
    }

    let ack1 = next_of_type(&mut ws, "job:ack").await;
    assert_eq!(ack1["id"], "c-run");
    let ack2 = next_of_type(&mut ws, "job:ack").await;
    assert_eq!(ack2["id"], "c-queued");
    let queued_id = ack2["jobId"].as_str().unwrap().to_string();

    ws.send(Message::Text(
        json!({ "type": "job:cancel", "jobId": queued_id }).to_string().into(),
    ))
    .await
    .unwrap();

    // The queued job terminates with job:cancel; the running one
    // completes normally.
    let cancel = next_of_type(&mut ws, "job:cancel").await;
    assert_eq!(cancel["jobId"], queued_id.as_str());
    let complete = next_of_type(&mut ws, "job:complete").await;
    assert_eq!(complete["jobId"], ack1["jobId"]);

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disconnect_does_not_cancel_jobs() {
    let app = build_test_app(Duration::from_millis(200));
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(
        json!({
            "type": "job:submit",
            "id": "c1",
            "jobType": "generate",
            "params": { "prompt": "survives disconnect", "seed": 7u64 },
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    next_of_type(&mut ws, "job:ack").await;

    // Drop the socket while the job runs.
    drop(ws);

    // The job still completes and its blob lands in storage.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if app.state.blobs.health().count >= 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job did not complete after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_with_unknown_ref_is_ref_not_found() {
    let app = build_test_app(Duration::ZERO);
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(
        json!({
            "type": "job:submit",
            "id": "c1",
            "jobType": "generate",
            "params": { "prompt": "p", "init_image_ref": "expiredref" },
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let error = next_of_type(&mut ws, "job:error").await;
    assert_eq!(error["kind"], "RefNotFound");
    assert_eq!(error["id"], "c1");

    app.state.pool.clone().shutdown_async().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dream_lifecycle_over_ws() {
    let app = build_test_app(Duration::ZERO);
    let addr = spawn_server(&app).await;

    let mut ws = connect(addr).await;
    next_of_type(&mut ws, "system:status").await;

    ws.send(Message::Text(
        json!({
            "type": "dream:start",
            "id": "d1",
            "prompt": "sunset",
            "durationHours": 0.01,
            "temperature": 0.5,
            "intervalMs": 50,
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let started = next_of_type(&mut ws, "dream:started").await;
    assert_eq!(started["id"], "d1");
    assert!(started["sessionId"].is_string());

    // A second start while dreaming is refused.
    ws.send(Message::Text(
        json!({ "type": "dream:start", "id": "d2", "prompt": "other" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let busy = next_of_type(&mut ws, "job:error").await;
    assert_eq!(busy["kind"], "DreamBusy");

    // Let a few ticks land, steer, then stop.
    tokio::time::sleep(Duration::from_millis(250)).await;
    ws.send(Message::Text(
        json!({ "type": "dream:guide", "id": "d3", "prompt": "ocean" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    let guided = next_of_type(&mut ws, "dream:guide:ack").await;
    assert_eq!(guided["prompt"], "ocean");

    ws.send(Message::Text(
        json!({ "type": "dream:stop", "id": "d4" }).to_string().into(),
    ))
    .await
    .unwrap();
    let stopped = next_of_type(&mut ws, "dream:stopped").await;
    assert!(stopped["stats"]["total"].as_u64().unwrap() >= 1);
    assert!(!app.state.dream.is_active());

    app.state.pool.clone().shutdown_async().await;
}
