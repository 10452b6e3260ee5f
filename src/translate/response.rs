//! Non-streaming response translation: upstream `OpenAI` payload ->
//! canonical form -> dialect response.
//!
//! Pure functions: the wall-clock timestamp is an argument, so translating
//! the same upstream payload twice yields byte-identical output.

use chrono::{DateTime, Utc};

use crate::error::{ProxyError, Result};

use super::canonical::{CanonicalRequest, CanonicalResponse, UsageCounters};
use super::ollama_types::{
    ChatMessage, ChatResponse, GenerateResponse, OllamaErrorResponse,
};
use super::openai_types::{ChatCompletionResponse, ChatErrorResponse};

/// Lift an upstream chat completion into canonical form. A response with no
/// choices does not match the backend contract and is a translation error.
pub fn openai_to_canonical(resp: &ChatCompletionResponse) -> Result<CanonicalResponse> {
    let choice = resp
        .choices
        .first()
        .ok_or_else(|| ProxyError::translation("upstream response has no choices"))?;

    let usage = resp.usage.as_ref().map_or_else(UsageCounters::default, |u| {
        UsageCounters {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    });

    Ok(CanonicalResponse {
        content: choice.message.content.clone().unwrap_or_default(),
        finish_reason: choice.finish_reason.clone(),
        usage,
        model: resp.model.clone(),
    })
}

/// Shape a canonical response for Ollama's `/api/generate` contract. The
/// model echoed back is what the client originally asked for, not the
/// backend name it was mapped to.
#[must_use]
pub fn canonical_to_generate(
    resp: &CanonicalResponse,
    original: &CanonicalRequest,
    created_at: DateTime<Utc>,
) -> GenerateResponse {
    GenerateResponse {
        model: original.requested_model.clone(),
        created_at,
        response: resp.content.clone(),
        done: true,
        done_reason: resp.finish_reason.as_deref().map(map_finish_reason),
        prompt_eval_count: Some(resp.usage.prompt_tokens),
        eval_count: Some(resp.usage.completion_tokens),
        total_duration: None,
        error: None,
    }
}

/// Shape a canonical response for Ollama's `/api/chat` contract.
#[must_use]
pub fn canonical_to_chat(
    resp: &CanonicalResponse,
    original: &CanonicalRequest,
    created_at: DateTime<Utc>,
) -> ChatResponse {
    ChatResponse {
        model: original.requested_model.clone(),
        created_at,
        message: ChatMessage {
            role: "assistant".to_string(),
            content: resp.content.clone(),
            images: None,
        },
        done: true,
        done_reason: resp.finish_reason.as_deref().map(map_finish_reason),
        prompt_eval_count: Some(resp.usage.prompt_tokens),
        eval_count: Some(resp.usage.completion_tokens),
        total_duration: None,
        error: None,
    }
}

/// Rewrite an upstream chat completion for an inbound `/v1` caller: the body
/// keeps the `OpenAI` shape, but the model field echoes the client's name.
#[must_use]
pub fn reshape_openai_response(
    mut resp: ChatCompletionResponse,
    original: &CanonicalRequest,
) -> ChatCompletionResponse {
    resp.model = original.requested_model.clone();
    resp
}

/// Map `OpenAI` finish reasons to Ollama done reasons.
#[must_use]
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" | "content_filter" => "stop".to_string(),
        "length" => "length".to_string(),
        other => other.to_string(),
    }
}

/// Translate an upstream error body into Ollama's bare error shape. The
/// upstream message is assumed provider-facing and already sanitized by the
/// caller where needed.
#[must_use]
pub fn openai_error_to_ollama(err: &ChatErrorResponse) -> OllamaErrorResponse {
    OllamaErrorResponse::new(&err.error.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::translate::ollama_types::ChatRequest;
    use crate::translate::request::ollama_chat_to_canonical;

    fn upstream_response(content: &str, total: u64, completion: u64) -> ChatCompletionResponse {
        serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-abc",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-3.5-turbo",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": total - completion,
                "completion_tokens": completion,
                "total_tokens": total
            }
        }))
        .unwrap()
    }

    fn canonical_chat(model: &str) -> CanonicalRequest {
        let mut config = test_config();
        config
            .models
            .insert("llama2".to_string(), "gpt-3.5-turbo".to_string());
        let req: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false
        }))
        .unwrap();
        ollama_chat_to_canonical(&req, &config).unwrap()
    }

    #[test]
    fn test_mapped_model_echoes_original_name() {
        // llama2 was mapped to gpt-3.5-turbo on the way out; the caller
        // still sees llama2, with upstream usage counters carried over.
        let original = canonical_chat("llama2");
        let canonical = openai_to_canonical(&upstream_response("hello", 5, 5)).unwrap();
        let now = Utc::now();
        let out = canonical_to_chat(&canonical, &original, now);

        assert_eq!(out.model, "llama2");
        assert_eq!(out.message.content, "hello");
        assert!(out.done);
        assert_eq!(out.done_reason.as_deref(), Some("stop"));
        assert_eq!(out.eval_count, Some(5));
    }

    #[test]
    fn test_generate_shape() {
        let mut config = test_config();
        config.models.clear();
        let req: crate::translate::ollama_types::GenerateRequest =
            serde_json::from_value(serde_json::json!({
                "model": "llama2", "prompt": "hi", "stream": false
            }))
            .unwrap();
        let original =
            crate::translate::request::ollama_generate_to_canonical(&req, &config).unwrap();

        let canonical = openai_to_canonical(&upstream_response("hello", 15, 10)).unwrap();
        let out = canonical_to_generate(&canonical, &original, Utc::now());
        assert_eq!(out.response, "hello");
        assert_eq!(out.prompt_eval_count, Some(5));
        assert_eq!(out.eval_count, Some(10));
    }

    #[test]
    fn test_translation_is_idempotent() {
        let original = canonical_chat("llama2");
        let upstream = upstream_response("hello", 5, 5);
        let fixed_time = Utc::now();

        let a = canonical_to_chat(&openai_to_canonical(&upstream).unwrap(), &original, fixed_time);
        let b = canonical_to_chat(&openai_to_canonical(&upstream).unwrap(), &original, fixed_time);
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_no_choices_is_malformed_upstream() {
        let resp: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "id": "x", "object": "chat.completion", "model": "m", "choices": []
        }))
        .unwrap();
        let err = openai_to_canonical(&resp).unwrap_err();
        assert!(matches!(err, ProxyError::Translation { .. }));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), "stop");
        assert_eq!(map_finish_reason("length"), "length");
        assert_eq!(map_finish_reason("content_filter"), "stop");
        assert_eq!(map_finish_reason("tool_calls"), "tool_calls");
    }
}
