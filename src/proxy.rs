//! Request orchestration: canonical request in, dialect response out.
//!
//! One backend call per inbound request, through the resilient
//! [`UpstreamClient`]. Upstream error bodies are translated to the caller's
//! dialect and forwarded with their original status, so a 401 from the
//! backend stays a 401 at the edge. Streaming responses hand the byte stream
//! to the pump; nothing here buffers a streamed payload.

use std::pin::Pin;

use bytes::Bytes;
use chrono::Utc;
use futures::stream::Stream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::pump::{pump, StreamEnd};
use crate::translate::canonical::{CanonicalRequest, Dialect, Operation};
use crate::translate::ollama_types::{
    EmbeddingsRequest, EmbeddingsResponse, OllamaErrorResponse,
};
use crate::translate::openai_types::{
    ChatCompletionResponse, ChatErrorResponse, EmbeddingInput, EmbeddingRequest,
    EmbeddingResponse,
};
use crate::translate::request::canonical_to_openai;
use crate::translate::response::{
    canonical_to_chat, canonical_to_generate, openai_error_to_ollama, openai_to_canonical,
    reshape_openai_response,
};
use crate::translate::streaming::ChunkTranslator;
use crate::upstream::UpstreamClient;

pub type BodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// What the handler sends back: a complete JSON body, or a framed stream.
pub enum CompletionOutcome {
    Json {
        status: u16,
        body: serde_json::Value,
    },
    Stream {
        content_type: &'static str,
        body: BodyStream,
    },
}

/// Forward a completion request to the backend and shape the reply for the
/// caller's dialect. `on_stream_end` fires once when a streaming response
/// terminates (unused on the non-streaming path).
pub async fn proxy_completion<F>(
    dialect: Dialect,
    canonical: CanonicalRequest,
    client: &UpstreamClient,
    request_id: Uuid,
    on_stream_end: F,
) -> Result<CompletionOutcome>
where
    F: FnOnce(StreamEnd) + Send + 'static,
{
    let outbound = canonical_to_openai(&canonical);
    info!(
        %request_id,
        model = %outbound.model,
        requested = %canonical.requested_model,
        streaming = canonical.stream,
        "Forwarding completion"
    );

    let response = client.post_json("/chat/completions", &outbound).await?;
    let status = response.status().as_u16();

    if status >= 400 {
        let body = response.text().await.unwrap_or_default();
        warn!(%request_id, status, "Upstream rejected completion");
        return Ok(CompletionOutcome::Json {
            status,
            body: translate_upstream_error(dialect, status, &body),
        });
    }

    if canonical.stream {
        let translator = ChunkTranslator::new(
            dialect,
            canonical.operation,
            &canonical.requested_model,
            Utc::now(),
        );
        let body: BodyStream = Box::pin(pump(
            response.bytes_stream(),
            translator,
            request_id,
            on_stream_end,
        ));
        return Ok(CompletionOutcome::Stream {
            content_type: stream_content_type(dialect),
            body,
        });
    }

    let upstream: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|e| ProxyError::translation(format!("unparseable upstream response: {e}")))?;

    Ok(CompletionOutcome::Json {
        status: 200,
        body: shape_completion(dialect, &canonical, upstream)?,
    })
}

/// Shape a successful upstream completion for the caller's dialect.
fn shape_completion(
    dialect: Dialect,
    original: &CanonicalRequest,
    upstream: ChatCompletionResponse,
) -> Result<serde_json::Value> {
    let body = match dialect {
        Dialect::Ollama => {
            let canonical = openai_to_canonical(&upstream)?;
            let now = Utc::now();
            match original.operation {
                Operation::Generate => {
                    serde_json::to_value(canonical_to_generate(&canonical, original, now))?
                }
                Operation::Chat => {
                    serde_json::to_value(canonical_to_chat(&canonical, original, now))?
                }
            }
        }
        Dialect::OpenAi => serde_json::to_value(reshape_openai_response(upstream, original))?,
    };
    Ok(body)
}

/// Forward an embeddings request. Ollama callers send a single prompt and
/// get a bare vector back; `/v1` callers get the backend's shape with the
/// model name echoed.
pub async fn proxy_embeddings(
    dialect: Dialect,
    body: &Bytes,
    config: &ProxyConfig,
    client: &UpstreamClient,
    request_id: Uuid,
) -> Result<(u16, serde_json::Value)> {
    let (outbound, requested_model) = match dialect {
        Dialect::Ollama => {
            let req: EmbeddingsRequest = serde_json::from_slice(body)
                .map_err(|e| ProxyError::client_input(format!("invalid request body: {e}")))?;
            let requested = req.model.clone();
            (ollama_embeddings_outbound(&req, config), requested)
        }
        Dialect::OpenAi => {
            let mut req: EmbeddingRequest = serde_json::from_slice(body)
                .map_err(|e| ProxyError::client_input(format!("invalid request body: {e}")))?;
            let requested = req.model.clone();
            req.model = config.resolve_model(&req.model);
            (req, requested)
        }
    };

    info!(%request_id, model = %outbound.model, "Forwarding embeddings");
    let response = client.post_json("/embeddings", &outbound).await?;
    let status = response.status().as_u16();

    if status >= 400 {
        let text = response.text().await.unwrap_or_default();
        warn!(%request_id, status, "Upstream rejected embeddings");
        return Ok((status, translate_upstream_error(dialect, status, &text)));
    }

    let upstream: EmbeddingResponse = response
        .json()
        .await
        .map_err(|e| ProxyError::translation(format!("unparseable embeddings response: {e}")))?;

    let body = match dialect {
        Dialect::Ollama => serde_json::to_value(embedding_to_ollama(&upstream)?)?,
        Dialect::OpenAi => {
            let mut resp = upstream;
            resp.model = requested_model;
            serde_json::to_value(resp)?
        }
    };
    Ok((200, body))
}

fn ollama_embeddings_outbound(req: &EmbeddingsRequest, config: &ProxyConfig) -> EmbeddingRequest {
    EmbeddingRequest {
        model: config.resolve_model(&req.model),
        input: EmbeddingInput::Text(req.prompt.clone()),
        encoding_format: None,
        extra: std::collections::HashMap::default(),
    }
}

fn embedding_to_ollama(resp: &EmbeddingResponse) -> Result<EmbeddingsResponse> {
    let first = resp
        .data
        .first()
        .ok_or_else(|| ProxyError::translation("upstream embeddings response has no data"))?;
    Ok(EmbeddingsResponse {
        embedding: first.embedding.clone(),
    })
}

/// Translate an upstream error body into the caller's dialect, preserving
/// the upstream message when it parses and falling back to a generic one
/// when it does not.
#[must_use]
pub fn translate_upstream_error(dialect: Dialect, status: u16, body: &str) -> serde_json::Value {
    let parsed: Option<ChatErrorResponse> = serde_json::from_str(body).ok();
    match dialect {
        Dialect::Ollama => {
            let err = parsed.as_ref().map_or_else(
                || OllamaErrorResponse::new(format!("upstream returned status {status}")),
                openai_error_to_ollama,
            );
            serde_json::to_value(err).unwrap_or_default()
        }
        Dialect::OpenAi => {
            let err = parsed.unwrap_or_else(|| {
                ChatErrorResponse::new("api_error", format!("upstream returned status {status}"))
            });
            serde_json::to_value(err).unwrap_or_default()
        }
    }
}

fn stream_content_type(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Ollama => "application/x-ndjson",
        Dialect::OpenAi => "text/event-stream",
    }
}
