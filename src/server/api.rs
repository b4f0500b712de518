//! Gateway HTTP API.
//!
//! - POST /api/v1/llm/generate
//! - POST /api/v1/llm/stream
//! - GET /, GET /api/v1 and GET /api/v1/
//! - GET /health
//! - GET /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TokenLimits;
use crate::error::GatewayError;
use crate::inference::client::ModelClient;
use crate::metrics::Metrics;
use crate::prompt::{build_context, build_prompt};
use crate::server::auth::{AccessGuard, Authenticated};
use crate::server::streaming::{events_to_sse_stream, StreamTracker};

pub const GENERATE_PATH: &str = "/api/v1/llm/generate";
pub const STREAM_PATH: &str = "/api/v1/llm/stream";

/// Application state shared across handlers.
pub struct AppState {
    pub model: Arc<dyn ModelClient>,
    pub guard: AccessGuard,
    pub metrics: Arc<Metrics>,

    /// Configured prompt token bounds, not enforced yet.
    pub token_limits: TokenLimits,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        model: Arc<dyn ModelClient>,
        guard: AccessGuard,
        metrics: Arc<Metrics>,
        token_limits: TokenLimits,
    ) -> Self {
        Self {
            model,
            guard,
            metrics,
            token_limits,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/api/v1", get(root))
        .route("/api/v1/", get(root))
        .route(GENERATE_PATH, post(generate))
        .route(STREAM_PATH, post(stream))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// CORS policy for the configured origins; `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerationRequest {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationResponse {
    pub response: String,
}

#[derive(Debug, Serialize)]
pub struct RootResponse {
    pub msg: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub model_id: String,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn root() -> Json<RootResponse> {
    Json(RootResponse { msg: "working!" })
}

/// Prompt for a request, with the query trimmed and context attached.
fn prepare_prompt(req: &GenerationRequest) -> String {
    let query = req.query.trim();
    let context = build_context(query);
    build_prompt(query, &context)
}

async fn generate(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Json(req): Json<GenerationRequest>,
) -> Result<Json<GenerationResponse>, GatewayError> {
    let request_id = Uuid::new_v4();
    info!(%request_id, query_len = req.query.len(), "Generate request");

    let prompt = prepare_prompt(&req);

    let started = Instant::now();
    match state.model.generate(&prompt).await {
        Ok(response) => {
            let elapsed = started.elapsed();
            state.metrics.observe_generation(elapsed);
            state.metrics.record_request(GENERATE_PATH, "ok");
            info!(
                %request_id,
                llm_generation_secs = elapsed.as_secs_f64(),
                "Generated LLM response"
            );
            Ok(Json(GenerationResponse { response }))
        }
        Err(e) => {
            state.metrics.record_request(GENERATE_PATH, "error");
            error!(%request_id, error = %e, "Failed to generate LLM response");
            Err(GatewayError::Generate(e))
        }
    }
}

async fn stream(
    State(state): State<Arc<AppState>>,
    _auth: Authenticated,
    Json(req): Json<GenerationRequest>,
) -> Result<Response, GatewayError> {
    let request_id = Uuid::new_v4();
    info!(%request_id, query_len = req.query.len(), "Stream request");

    let prompt = prepare_prompt(&req);

    let started = Instant::now();
    let rx = state.model.generate_stream(&prompt).await.map_err(|e| {
        state.metrics.record_request(STREAM_PATH, "error");
        error!(%request_id, error = %e, "Error during stream generation");
        GatewayError::Stream(e)
    })?;

    let tracker = StreamTracker::new(request_id, started, state.metrics.clone());
    Ok(Sse::new(events_to_sse_stream(rx, tracker)).into_response())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        model_id: state.model.model_id().to_string(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
