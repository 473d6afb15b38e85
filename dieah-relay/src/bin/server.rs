//! Dieah Relay Server
//!
//! HTTP front for the relay, used by the conversation handler.

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dieah_relay::{
    config::Config,
    context::ContextResponse,
    health::HealthStatus,
    remote::HttpWorker,
    Relay,
};

type SharedState = Arc<Relay>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!("Starting Dieah Relay Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let worker = HttpWorker::new(config.worker_url.clone(), config.request_timeout())?;
    let port = config.server_port;
    let relay = Arc::new(Relay::open(config, Arc::new(worker))?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = relay.start_background(shutdown_rx);

    let app = Router::new()
        .route("/health", get(health))
        .route("/capture", post(capture))
        .route("/context", post(context))
        .route("/status", get(status))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(relay);

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in background {
        let _ = handle.await;
    }

    Ok(())
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CaptureRequest {
    session_id: String,
    user_message: String,
    assistant_response: String,
    channel: String,
}

#[derive(Debug, Serialize)]
struct CaptureResponse {
    id: String,
}

async fn capture(
    State(relay): State<SharedState>,
    Json(req): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<CaptureResponse>), StatusCode> {
    let id = relay
        .capture(&req.session_id, &req.user_message, &req.assistant_response, &req.channel)
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to store capture");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok((StatusCode::CREATED, Json(CaptureResponse { id: id.to_string() })))
}

#[derive(Debug, Deserialize)]
struct ContextRequest {
    query: String,
}

async fn context(
    State(relay): State<SharedState>,
    Json(req): Json<ContextRequest>,
) -> Json<ContextResponse> {
    Json(relay.get_context(&req.query).await)
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    health: HealthStatus,
    worker_reachable: bool,
}

async fn status(State(relay): State<SharedState>) -> Result<Json<StatusResponse>, StatusCode> {
    let health = relay.status().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let worker_reachable = relay.worker_reachable().await;

    Ok(Json(StatusResponse {
        health,
        worker_reachable,
    }))
}
