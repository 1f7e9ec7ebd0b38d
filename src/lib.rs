//! promptgate: a stateless HTTP gateway in front of an LLM completion
//! backend.
//!
//! Every chat request runs the same pipeline: authenticate, parse,
//! validate, optionally retrieve context, safety-check, complete, and
//! assemble the response. All per-request state lives on the stack of one
//! handler invocation; the only shared mutable state is metric counters
//! and caches that are safe under concurrency.

pub mod auth;
pub mod completion;
pub mod config;
pub mod correlation;
pub mod error;
pub mod pipeline;
pub mod retrieval;
pub mod safety;
pub mod telemetry;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use crate::auth::TokenVerifier;
use crate::completion::{
    CompletionClient, HttpCompletionBackend, SamplingParams, TokenUsage,
};
use crate::config::AppConfig;
use crate::correlation::CorrelationId;
use crate::pipeline::{ChatOutcome, ChatPayload, Pipeline};
use crate::retrieval::{HttpSearchBackend, RetrievalClient};
use crate::safety::KeywordSafetyFilter;
use crate::telemetry::{Metrics, Recorder};

pub const SERVICE_NAME: &str = "promptgate";

const CORRELATION_HEADER: &str = "x-correlation-id";

/// Shared handler state. Cheap to clone; everything inside is `Arc`ed.
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

/// Build the router. `max_request_bytes` caps the accepted body size
/// before any handler runs.
pub fn app(state: AppState, max_request_bytes: Option<usize>) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/metrics", get(metrics))
        .with_state(state);
    match max_request_bytes {
        Some(limit) => router.layer(DefaultBodyLimit::max(limit)),
        None => router,
    }
}

/// Wire the real HTTP backends from configuration. Missing endpoints do
/// not fail startup; the affected phase reports a configuration error (or
/// degrades, for retrieval) at request time.
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let metrics = Arc::new(Metrics::new());
    let recorder = Recorder::new(
        config.trace_export_file.as_deref(),
        &config.rotation,
        metrics.clone(),
    );

    let verifier = Arc::new(TokenVerifier::new(
        config.jwt_validation_enabled,
        config.entra_issuer.clone(),
        config.entra_audience.clone(),
        config.upstream_timeout,
        config.jwks_cache_ttl,
    )?);

    let retrieval = match (&config.search_endpoint, &config.search_index) {
        (Some(endpoint), Some(index)) => {
            let backend = HttpSearchBackend::new(
                endpoint.clone(),
                index.clone(),
                config.upstream_timeout,
            )?;
            Some(RetrievalClient::new(Arc::new(backend)))
        }
        _ => None,
    };

    let completion = match &config.openai_endpoint {
        Some(endpoint) => {
            let backend = HttpCompletionBackend::new(
                endpoint.clone(),
                config.openai_deployment.clone(),
                config.upstream_timeout,
            )?;
            Some(CompletionClient::new(
                Arc::new(backend),
                SamplingParams {
                    temperature: config.completion_temperature,
                    max_tokens: config.completion_max_tokens,
                },
                metrics.clone(),
            ))
        }
        None => {
            tracing::warn!("OPENAI_ENDPOINT not set; completion requests will fail");
            None
        }
    };

    let safety = Arc::new(KeywordSafetyFilter::new(config.safety_blocklist.clone()));

    let pipeline = Pipeline::new(
        verifier,
        retrieval,
        safety,
        completion,
        recorder,
        config.rag_enabled,
        config.search_top_k,
    );
    Ok(AppState::new(pipeline))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    answer: String,
    correlation_id: CorrelationId,
    model: String,
    usage: TokenUsage,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BlockedResponse {
    blocked: bool,
    reason: &'static str,
    categories: Vec<String>,
    correlation_id: CorrelationId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    correlation_id: CorrelationId,
}

fn with_correlation(mut response: Response, correlation_id: &CorrelationId) -> Response {
    if let Ok(value) = HeaderValue::from_str(correlation_id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn health() -> Response {
    let correlation_id = CorrelationId::generate();
    let body = HealthResponse {
        status: "healthy",
        service: SERVICE_NAME,
        correlation_id: correlation_id.clone(),
    };
    with_correlation((StatusCode::OK, Json(body)).into_response(), &correlation_id)
}

async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> Response {
    let bearer = auth::extract_bearer_token(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    );
    let payload = payload
        .map(|Json(payload)| payload)
        .map_err(|_| "Invalid JSON in request body".to_string());

    let (correlation_id, outcome) = state.pipeline.handle_chat(bearer, payload).await;
    let response = match outcome {
        ChatOutcome::Success(result) => (
            StatusCode::OK,
            Json(ChatResponse {
                answer: result.answer,
                correlation_id: correlation_id.clone(),
                model: result.model,
                usage: result.usage,
            }),
        )
            .into_response(),
        ChatOutcome::Blocked { categories } => (
            StatusCode::OK,
            Json(BlockedResponse {
                blocked: true,
                reason: "Content blocked by safety filter",
                categories,
                correlation_id: correlation_id.clone(),
            }),
        )
            .into_response(),
        ChatOutcome::Error(err) => {
            (err.status(), Json(err.body(&correlation_id))).into_response()
        }
    };
    with_correlation(response, &correlation_id)
}

async fn metrics(State(state): State<AppState>) -> Response {
    let recorder = state.pipeline.recorder();
    let body = recorder.metrics.render_prometheus(
        recorder.export_lines_total(),
        recorder.export_errors_total(),
    );
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}
