use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderName, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use darkroom_api::config::ServerConfig;
use darkroom_api::{broadcast, router, state::AppState, ws};
use darkroom_comfy::{ComfyEndpoints, ComfyWorkerFactory};
use darkroom_core::mode::{ModeConfig, ModeProvider};
use darkroom_core::registry::{ModelRegistry, NullMemoryProbe};
use darkroom_core::workflow::WorkflowConfig;
use darkroom_engine::pool::{PoolOptions, WorkerPool};
use darkroom_engine::{BlobStore, DreamController, FileRefStore};
use darkroom_events::EventBus;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "darkroom_api=debug,darkroom_engine=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = config.port, "Loaded server configuration");

    // Bad mode/workflow documents are unrecoverable init failures.
    let modes = Arc::new(
        ModeConfig::load(&config.modes_config).expect("Failed to load modes configuration"),
    );
    tracing::info!(
        count = modes.list().len(),
        default = %modes.default_mode(),
        "Mode configuration loaded"
    );
    let workflows = Arc::new(
        WorkflowConfig::load(&config.workflows_config)
            .expect("Failed to load workflows configuration"),
    );
    tracing::info!(count = workflows.list().len(), "Workflow catalogue loaded");

    // --- Engine pieces ---
    let registry = Arc::new(ModelRegistry::new(Box::new(NullMemoryProbe)));
    let bus = Arc::new(EventBus::default());
    let blobs = Arc::new(BlobStore::new());
    let filerefs = Arc::new(FileRefStore::default());

    let sweeper_cancel = CancellationToken::new();
    let sweeper_handle = Arc::clone(&filerefs).spawn_sweeper(sweeper_cancel.clone());

    let factory = Arc::new(ComfyWorkerFactory::new(
        ComfyEndpoints {
            ws_url: config.comfy_ws_url.clone(),
            api_url: config.comfy_api_url.clone(),
        },
        Arc::clone(&workflows),
    ));

    let pool = WorkerPool::start(
        PoolOptions {
            queue_max: config.queue_max,
            job_timeout: Duration::from_secs(config.job_timeout_secs),
            initial_mode: Some(modes.default_mode()),
        },
        factory,
        Arc::clone(&modes) as Arc<dyn ModeProvider>,
        Arc::clone(&registry),
        Arc::clone(&blobs),
        Arc::clone(&bus),
    )
    .expect("Failed to start worker pool");
    tracing::info!(mode = ?pool.current_mode(), "Worker pool started");

    // --- WebSocket + dream ---
    let ws_manager = Arc::new(ws::WsManager::new());
    let heartbeat_handle = ws::start_heartbeat(Arc::clone(&ws_manager));
    let dream = Arc::new(DreamController::new(Arc::clone(&pool), Arc::clone(&bus)));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        pool: Arc::clone(&pool),
        ws: Arc::clone(&ws_manager),
        bus: Arc::clone(&bus),
        registry: Arc::clone(&registry),
        blobs: Arc::clone(&blobs),
        filerefs: Arc::clone(&filerefs),
        dream: Arc::clone(&dream),
        modes: Arc::clone(&modes),
        workflows: Arc::clone(&workflows),
        http: reqwest::Client::new(),
    };

    // --- Broadcasters ---
    let broadcast_cancel = CancellationToken::new();
    let status_handle = broadcast::spawn_status_broadcaster(state.clone(), broadcast_cancel.clone());
    let events_handle = broadcast::spawn_event_broadcaster(state.clone(), broadcast_cancel.clone());

    // --- Router + middleware ---
    let request_id_header = HeaderName::from_static("x-request-id");
    let app = router::build_router(state)
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(build_cors_layer(&config));

    // --- Serve ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop the dream first so it can't refill the queue.
    if dream.is_active() {
        let _ = dream.stop().await;
        tracing::info!("Dream session stopped");
    }

    // Drain the pool: in-flight job completes, queued jobs fail with
    // Shutdown, the worker unloads.
    Arc::clone(&pool).shutdown_async().await;
    tracing::info!("Worker pool drained");

    broadcast_cancel.cancel();
    sweeper_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), status_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), events_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), sweeper_handle).await;
    filerefs.clear();

    ws_manager.shutdown_all().await;
    heartbeat_handle.abort();

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT or SIGTERM so the server shuts down cleanly whether
/// stopped interactively or by a process manager.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Build the CORS middleware layer. Panics on invalid origins: we want
/// misconfiguration to fail fast at startup.
fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<_> = config
        .cors_origins
        .iter()
        .map(|o| {
            o.parse()
                .unwrap_or_else(|e| panic!("Invalid CORS origin '{o}': {e}"))
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .max_age(Duration::from_secs(3600))
}
