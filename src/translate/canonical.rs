//! Backend-agnostic intermediate form.
//!
//! Every inbound request is resolved to a [`Dialect`] tag and a
//! [`CanonicalRequest`] once, at the normalizer boundary; the rest of the
//! pipeline works on these values and never inspects raw wire shapes again.

use serde::{Deserialize, Serialize};

/// The two wire conventions the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Ollama `/api/*` surface, NDJSON streaming.
    Ollama,
    /// OpenAI `/v1/*` surface, SSE streaming.
    OpenAi,
}

impl Dialect {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

/// Which inbound operation produced the request. Ollama's `generate` and
/// `chat` endpoints share the translation pipeline but answer in different
/// shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Generate,
    Chat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalMessage {
    pub role: String,
    pub content: String,
    /// Base64-encoded image attachments, present only when the images
    /// feature is enabled.
    pub images: Vec<String>,
}

impl CanonicalMessage {
    #[must_use]
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            images: Vec::new(),
        }
    }
}

/// Generation options after the 1:1 key mapping. Unrecognized inbound option
/// keys were already dropped by the adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u64>,
    pub max_tokens: Option<u64>,
    pub stop: Option<Vec<String>>,
}

/// One inbound call, fully resolved: model already mapped, messages flattened
/// and ordered, options normalized. Created per request and discarded after
/// dispatch.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    /// Backend model id (after mapping-table / default resolution).
    pub model: String,
    /// Model id the client asked for, echoed back in responses.
    pub requested_model: String,
    pub messages: Vec<CanonicalMessage>,
    pub options: GenerationOptions,
    pub stream: bool,
    pub operation: Operation,
}

/// Token usage counters, mapped 1:1 from the upstream response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A complete non-streaming upstream answer in canonical form.
#[derive(Debug, Clone)]
pub struct CanonicalResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: UsageCounters,
    pub model: String,
}

/// One upstream streaming event in canonical form. `done` marks the
/// upstream's final event; the dialect adapters append their own
/// termination marker on top of it.
#[derive(Debug, Clone)]
pub struct CanonicalChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageCounters>,
    pub done: bool,
}
