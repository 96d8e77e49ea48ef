//! HTTP gateway for agentgate.
//!
//! Routes:
//!
//! - `POST /agent_chat`      run or resume a session, streamed as SSE
//! - `GET  /sessions/{id}`   last checkpoint of a session
//! - `GET  /tools`           registered tool descriptors
//! - `GET  /health`          liveness probe
//!
//! Built on Axum. Every route shares one [`AgentRunner`].

pub mod api;
pub mod bootstrap;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{Router, response::Json, routing::get, routing::post};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use agentgate_agent::AgentRunner;
use agentgate_config::AppConfig;

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub runner: AgentRunner,
}

pub type SharedState = Arc<GatewayState>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Setup(#[from] agentgate_core::error::Error),

    #[error("Server I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Build the router with every gateway route.
///
/// Layers: CORS restricted to `allowed_origins`, a 1 MB body limit and
/// HTTP trace logging.
pub fn build_router(state: SharedState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agent_chat", post(api::agent_chat_handler))
        .route("/sessions/{id}", get(api::get_session_handler))
        .route("/tools", get(api::list_tools_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer(allowed_origins))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(3600))
}

/// Start the gateway HTTP server and serve until Ctrl-C.
pub async fn start(config: AppConfig) -> Result<(), GatewayError> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let runner = bootstrap::build_runner(&config).await?;
    let state = Arc::new(GatewayState { runner });
    let app = build_router(state, &config.gateway.allowed_origins);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
    }
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
