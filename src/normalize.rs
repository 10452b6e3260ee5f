//! Request Normalizer: the only place raw inbound bytes are interpreted.
//!
//! The body is read exactly once by axum into `Bytes`; everything downstream
//! (metrics, translator, logging) shares that buffer by cheap clone.
//! Classification resolves the inbound [`Dialect`] from the path once, and
//! the rest of the pipeline carries the tag instead of re-inspecting shapes.

use bytes::Bytes;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::translate::canonical::{CanonicalRequest, Dialect};
use crate::translate::ollama_types::{ChatRequest, GenerateRequest};
use crate::translate::openai_types::ChatCompletionRequest;
use crate::translate::request::{
    ollama_chat_to_canonical, ollama_generate_to_canonical, openai_chat_to_canonical,
};

/// Which dialect a path belongs to. `/api/*` is the Ollama surface,
/// everything else (`/v1/*`) the OpenAI one.
#[must_use]
pub fn classify_dialect(path: &str) -> Dialect {
    if path.starts_with("/api/") {
        Dialect::Ollama
    } else {
        Dialect::OpenAi
    }
}

/// Size and presence checks, applied before any parsing so an oversized
/// body never reaches the JSON parser.
pub fn check_body(body: &Bytes, config: &ProxyConfig) -> Result<()> {
    if body.len() > config.limits.max_body_bytes {
        return Err(ProxyError::PayloadTooLarge {
            limit: config.limits.max_body_bytes,
        });
    }
    if body.is_empty() {
        return Err(ProxyError::EmptyBody);
    }
    Ok(())
}

/// Classify, validate, parse, and translate an inbound completion request
/// in one pass. Malformed JSON is a client error, not a translation error.
pub fn normalize(
    path: &str,
    body: &Bytes,
    config: &ProxyConfig,
) -> Result<(Dialect, CanonicalRequest)> {
    check_body(body, config)?;
    let dialect = classify_dialect(path);

    let canonical = match (dialect, path) {
        (Dialect::Ollama, "/api/generate") => {
            let req: GenerateRequest = parse(body)?;
            ollama_generate_to_canonical(&req, config)?
        }
        (Dialect::Ollama, "/api/chat") => {
            let req: ChatRequest = parse(body)?;
            ollama_chat_to_canonical(&req, config)?
        }
        (Dialect::OpenAi, _) => {
            let req: ChatCompletionRequest = parse(body)?;
            openai_chat_to_canonical(&req, config)?
        }
        (Dialect::Ollama, other) => {
            return Err(ProxyError::client_input(format!(
                "unsupported endpoint: {other}"
            )))
        }
    };

    Ok((dialect, canonical))
}

fn parse<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::client_input(format!("invalid request body: {e}")))
}
