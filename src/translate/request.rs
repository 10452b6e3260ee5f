//! Inbound request translation: dialect wire shapes -> canonical form ->
//! outbound `OpenAI` Chat Completions request.
//!
//! A generate-style prompt flattens into a message list; chat-style requests
//! keep their message order. Model resolution and the fixed option-key table
//! are applied here, once. All functions are pure: they take the request plus
//! the config and return a value or an error.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

use super::canonical::{
    CanonicalMessage, CanonicalRequest, GenerationOptions, Operation,
};
use super::ollama_types::{ChatRequest, GenerateRequest, OllamaOptions};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatMessage, ContentPart, ImageUrlDetail, StreamOptions,
};

/// Map Ollama `options` keys onto canonical generation options through the
/// fixed 1:1 table. Unrecognized keys were already collected into
/// `options.extra` and are dropped silently.
fn map_options(options: Option<&OllamaOptions>) -> GenerationOptions {
    let Some(opts) = options else {
        return GenerationOptions::default();
    };
    GenerationOptions {
        temperature: opts.temperature,
        top_p: opts.top_p,
        top_k: opts.top_k,
        max_tokens: opts.num_predict,
        stop: opts.stop.clone(),
    }
}

fn check_images(images: Option<&Vec<String>>, config: &ProxyConfig) -> Result<Vec<String>> {
    match images {
        Some(imgs) if !imgs.is_empty() => {
            if config.features.images {
                Ok(imgs.clone())
            } else {
                Err(ProxyError::unsupported(
                    "image attachments are disabled on this gateway",
                ))
            }
        }
        _ => Ok(Vec::new()),
    }
}

fn check_tools(tools: Option<&serde_json::Value>, config: &ProxyConfig) -> Result<()> {
    if tools.is_some() && !config.features.tools {
        return Err(ProxyError::unsupported(
            "tool definitions are disabled on this gateway",
        ));
    }
    Ok(())
}

/// Translate an Ollama `/api/generate` request into canonical form.
pub fn ollama_generate_to_canonical(
    req: &GenerateRequest,
    config: &ProxyConfig,
) -> Result<CanonicalRequest> {
    let images = check_images(req.images.as_ref(), config)?;

    let mut messages = Vec::new();
    if let Some(ref system) = req.system {
        messages.push(CanonicalMessage::text("system", system.clone()));
    }
    messages.push(CanonicalMessage {
        role: "user".to_string(),
        content: req.prompt.clone(),
        images,
    });

    Ok(CanonicalRequest {
        model: config.resolve_model(&req.model),
        requested_model: req.model.clone(),
        messages,
        options: map_options(req.options.as_ref()),
        stream: req.stream,
        operation: Operation::Generate,
    })
}

/// Translate an Ollama `/api/chat` request into canonical form,
/// preserving message order.
pub fn ollama_chat_to_canonical(
    req: &ChatRequest,
    config: &ProxyConfig,
) -> Result<CanonicalRequest> {
    check_tools(req.tools.as_ref(), config)?;

    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        let images = check_images(msg.images.as_ref(), config)?;
        messages.push(CanonicalMessage {
            role: msg.role.clone(),
            content: msg.content.clone(),
            images,
        });
    }

    Ok(CanonicalRequest {
        model: config.resolve_model(&req.model),
        requested_model: req.model.clone(),
        messages,
        options: map_options(req.options.as_ref()),
        stream: req.stream,
        operation: Operation::Chat,
    })
}

/// Translate an inbound OpenAI `/v1/chat/completions` request into canonical
/// form. The backend speaks the same dialect, but the request still goes
/// through canonical form so model resolution and feature gates apply
/// uniformly.
pub fn openai_chat_to_canonical(
    req: &ChatCompletionRequest,
    config: &ProxyConfig,
) -> Result<CanonicalRequest> {
    check_tools(req.tools.as_ref(), config)?;

    let mut messages = Vec::with_capacity(req.messages.len());
    for msg in &req.messages {
        let mut images = Vec::new();
        if let ChatContent::Parts(parts) = &msg.content {
            for part in parts {
                if let ContentPart::ImageUrl { image_url } = part {
                    if !config.features.images {
                        return Err(ProxyError::unsupported(
                            "image attachments are disabled on this gateway",
                        ));
                    }
                    images.push(strip_data_url(&image_url.url));
                }
            }
        }
        messages.push(CanonicalMessage {
            role: msg.role.clone(),
            content: msg.content.as_text(),
            images,
        });
    }

    Ok(CanonicalRequest {
        model: config.resolve_model(&req.model),
        requested_model: req.model.clone(),
        messages,
        options: GenerationOptions {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_tokens: req.max_tokens,
            stop: req.stop.clone(),
        },
        stream: req.stream.unwrap_or(false),
        operation: Operation::Chat,
    })
}

/// Build the outbound request for the backend from canonical form.
pub fn canonical_to_openai(req: &CanonicalRequest) -> ChatCompletionRequest {
    let messages = req
        .messages
        .iter()
        .map(|msg| {
            let content = if msg.images.is_empty() {
                ChatContent::Text(msg.content.clone())
            } else {
                let mut parts = vec![ContentPart::Text {
                    text: msg.content.clone(),
                }];
                for img in &msg.images {
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrlDetail {
                            url: to_data_url(img),
                            detail: None,
                        },
                    });
                }
                ChatContent::Parts(parts)
            };
            ChatMessage {
                role: msg.role.clone(),
                content,
                name: None,
            }
        })
        .collect();

    // Usage on the final chunk is needed to fill Ollama's eval counters.
    let stream_options = req.stream.then_some(StreamOptions {
        include_usage: true,
    });

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.options.max_tokens,
        temperature: req.options.temperature,
        top_p: req.options.top_p,
        top_k: req.options.top_k,
        stream: req.stream.then_some(true),
        stream_options,
        stop: req.options.stop.clone(),
        tools: None,
        extra: std::collections::HashMap::default(),
    }
}

/// Ollama carries bare base64; OpenAI content parts want a data URL.
fn to_data_url(base64: &str) -> String {
    if base64.starts_with("data:") {
        base64.to_string()
    } else {
        format!("data:image/png;base64,{base64}")
    }
}

fn strip_data_url(url: &str) -> String {
    url.split_once(";base64,")
        .map_or_else(|| url.to_string(), |(_, data)| data.to_string())
}
