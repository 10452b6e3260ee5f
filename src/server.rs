//! HTTP surface: both dialect route families, health, and metrics.
//!
//! Handlers stay thin: read the body once, hand off to the normalizer and
//! proxy, shape errors for the caller's dialect. Every edge request records
//! exactly one metric sample, finalized when the handler resolves (for
//! streams, when the pump signals stream end).

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::metrics::{MetricSample, MetricsCollector, SnapshotFilter};
use crate::models;
use crate::normalize::{classify_dialect, normalize};
use crate::proxy::{self, CompletionOutcome};
use crate::pump::StreamEnd;
use crate::translate::canonical::Dialect;
use crate::translate::ollama_types::OllamaErrorResponse;
use crate::translate::openai_types::ChatErrorResponse;
use crate::upstream::{CircuitState, UpstreamClient};

use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub upstream: Arc<UpstreamClient>,
    pub metrics: Arc<MetricsCollector>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/generate", post(api_generate))
        .route("/api/chat", post(api_chat))
        .route("/api/embeddings", post(api_embeddings))
        .route("/api/tags", get(handle_tags))
        .route("/api/version", get(handle_version))
        .route("/v1/chat/completions", post(v1_chat_completions))
        .route("/v1/embeddings", post(v1_embeddings))
        .route("/v1/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics_text))
        .route("/metrics/json", get(handle_metrics_json))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn api_generate(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_completion(state, "/api/generate", body).await
}

async fn api_chat(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_completion(state, "/api/chat", body).await
}

async fn v1_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_completion(state, "/v1/chat/completions", body).await
}

async fn api_embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_embeddings(state, "/api/embeddings", body).await
}

async fn v1_embeddings(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    handle_embeddings(state, "/v1/embeddings", body).await
}

async fn handle_completion(state: Arc<AppState>, path: &'static str, body: Bytes) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    let dialect = classify_dialect(path);

    let mut sample = MetricSample::new(path, "POST");
    sample.request_bytes = body.len();

    // Streaming requests are sampled when the stream terminates, not at
    // handoff, so the duration covers the whole stream and a mid-flight
    // failure or client cancel shows up as an error.
    let metrics = Arc::clone(&state.metrics);
    let mut stream_sample = MetricSample::new(path, "POST");
    stream_sample.request_bytes = body.len();
    stream_sample.streaming = true;
    let on_stream_end = move |end: StreamEnd| {
        stream_sample.status = match end {
            StreamEnd::Completed => 200,
            StreamEnd::UpstreamError => 502,
            StreamEnd::Cancelled => 499,
        };
        finalize(&metrics, stream_sample, started);
    };

    let outcome = match normalize(path, &body, &state.config) {
        Ok((dialect, canonical)) => {
            sample.streaming = canonical.stream;
            proxy::proxy_completion(
                dialect,
                canonical,
                &state.upstream,
                request_id,
                on_stream_end,
            )
            .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(CompletionOutcome::Json { status, body }) => {
            sample.status = status;
            finalize(&state.metrics, sample, started);
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (code, Json(body)).into_response()
        }
        Ok(CompletionOutcome::Stream { content_type, body }) => {
            // The pump's end signal finalizes stream_sample
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", content_type)
                .header("cache-control", "no-cache")
                .body(Body::from_stream(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(e) => {
            sample.status = e.status_code();
            finalize(&state.metrics, sample, started);
            error_response(dialect, &e, request_id)
        }
    }
}

async fn handle_embeddings(state: Arc<AppState>, path: &'static str, body: Bytes) -> Response {
    let request_id = Uuid::new_v4();
    let started = Instant::now();
    let dialect = classify_dialect(path);

    let mut sample = MetricSample::new(path, "POST");
    sample.request_bytes = body.len();

    let outcome = match crate::normalize::check_body(&body, &state.config) {
        Ok(()) => {
            proxy::proxy_embeddings(dialect, &body, &state.config, &state.upstream, request_id)
                .await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok((status, body)) => {
            sample.status = status;
            finalize(&state.metrics, sample, started);
            let code = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            (code, Json(body)).into_response()
        }
        Err(e) => {
            sample.status = e.status_code();
            finalize(&state.metrics, sample, started);
            error_response(dialect, &e, request_id)
        }
    }
}

/// Ollama model listing. Backend ids are merged with configured aliases;
/// if the backend is unreachable the aliases alone are served so local
/// clients keep working.
async fn handle_tags(State(state): State<Arc<AppState>>) -> Response {
    let upstream_ids = match models::fetch_upstream_models(&state.upstream).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Model listing degraded to configured aliases");
            Vec::new()
        }
    };
    let names = models::merged_model_names(&state.config, &upstream_ids);
    Json(models::to_tags_response(&names, Utc::now())).into_response()
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Response {
    let upstream_ids = match models::fetch_upstream_models(&state.upstream).await {
        Ok(ids) => ids,
        Err(e) => {
            warn!(error = %e, "Model listing degraded to configured aliases");
            Vec::new()
        }
    };
    let names = models::merged_model_names(&state.config, &upstream_ids);
    Json(models::to_models_response(&names, Utc::now())).into_response()
}

async fn handle_version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let circuit = match state.upstream.breaker_state() {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    };
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "upstream_circuit": circuit,
    }))
}

async fn handle_metrics_text(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.export_text(),
    )
        .into_response()
}

async fn handle_metrics_json(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.metrics.snapshot(&SnapshotFilter::default());
    Json(serde_json::to_value(snapshot).unwrap_or_default())
}

fn finalize(metrics: &MetricsCollector, mut sample: MetricSample, started: Instant) {
    sample.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    metrics.record(sample);
}

/// Shape an error for the caller's dialect. The full error goes to the log;
/// the body carries only the sanitized message.
fn error_response(dialect: Dialect, err: &ProxyError, request_id: Uuid) -> Response {
    error!(%request_id, error = %err, "Request failed");
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);

    let body = match dialect {
        Dialect::Ollama => {
            serde_json::to_value(OllamaErrorResponse::new(err.public_message())).unwrap_or_default()
        }
        Dialect::OpenAi => {
            let error_type = match err.status_code() {
                400 | 413 => "invalid_request_error",
                503 => "service_unavailable",
                _ => "api_error",
            };
            serde_json::to_value(ChatErrorResponse::new(error_type, err.public_message()))
                .unwrap_or_default()
        }
    };

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_shapes_follow_dialect() {
        let err = ProxyError::unsupported("tool definitions are disabled on this gateway");

        let ollama = error_response(Dialect::Ollama, &err, Uuid::new_v4());
        assert_eq!(ollama.status(), StatusCode::BAD_REQUEST);

        let openai = error_response(Dialect::OpenAi, &err, Uuid::new_v4());
        assert_eq!(openai.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_circuit_open_maps_to_service_unavailable() {
        let resp = error_response(Dialect::Ollama, &ProxyError::CircuitOpen, Uuid::new_v4());
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
