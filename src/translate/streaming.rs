//! State machine for translating upstream `OpenAI` streaming chunks into
//! dialect wire frames.
//!
//! The [`ChunkTranslator`] processes one `ChatCompletionChunk` at a time. All
//! accumulated state (usage counters, finish reason, the fixed frame
//! timestamp) lives in the struct; there are no hidden globals, so two
//! translators fed the same chunks produce the same frames.
//!
//! Each returned frame is a complete wire unit including its framing:
//! an NDJSON line for Ollama callers, an SSE `data:` record for `OpenAI`
//! callers. [`ChunkTranslator::finish`] appends the dialect's own
//! termination marker (Ollama: a final `done:true` object with counters;
//! `OpenAI`: `data: [DONE]`), which is distinct from the upstream `[DONE]`
//! sentinel that triggers it.

use chrono::{DateTime, Utc};

use super::canonical::{CanonicalChunk, Dialect, Operation, UsageCounters};
use super::ollama_types::{ChatMessage, ChatResponse, GenerateResponse};
use super::openai_types::ChatCompletionChunk;
use super::response::map_finish_reason;

#[derive(Debug)]
pub struct ChunkTranslator {
    dialect: Dialect,
    operation: Operation,
    /// Model name the client asked for, echoed on every frame.
    model: String,
    created_at: DateTime<Utc>,
    usage: Option<UsageCounters>,
    finish_reason: Option<String>,
    finished: bool,
}

impl ChunkTranslator {
    #[must_use]
    pub fn new(
        dialect: Dialect,
        operation: Operation,
        model: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            dialect,
            operation,
            model: model.to_string(),
            created_at,
            usage: None,
            finish_reason: None,
            finished: false,
        }
    }

    /// Translate a single upstream chunk. Returns at most one frame; chunks
    /// that only carry bookkeeping (usage, finish reason) update state and
    /// return `None` because the dialect terminal frame reports them.
    pub fn translate_chunk(&mut self, chunk: &ChatCompletionChunk) -> Option<String> {
        if self.finished {
            return None;
        }

        let canonical = chunk_to_canonical(chunk);
        if let Some(usage) = canonical.usage {
            self.usage = Some(usage);
        }
        if let Some(ref reason) = canonical.finish_reason {
            self.finish_reason = Some(reason.clone());
        }

        match self.dialect {
            Dialect::Ollama => {
                if canonical.delta.is_empty() {
                    return None;
                }
                Some(self.ollama_frame(&canonical.delta, false, None, None))
            }
            Dialect::OpenAi => {
                // Same dialect on both sides: pass the chunk through with the
                // model field rewritten to what the caller requested.
                let mut out = chunk.clone();
                out.model = self.model.clone();
                let json = serde_json::to_string(&out).ok()?;
                Some(format!("data: {json}\n\n"))
            }
        }
    }

    /// Emit the dialect's termination marker. With `error` set this is the
    /// best-effort terminal frame for a broken upstream: still `done:true`,
    /// annotated so the client knows the stream did not complete normally.
    /// Idempotent; later calls return nothing.
    pub fn finish(&mut self, error: Option<&str>) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        match self.dialect {
            Dialect::Ollama => {
                let done_reason = if error.is_some() {
                    "error".to_string()
                } else {
                    self.finish_reason
                        .as_deref()
                        .map_or_else(|| "stop".to_string(), map_finish_reason)
                };
                vec![self.ollama_frame("", true, Some(done_reason), error)]
            }
            Dialect::OpenAi => {
                let mut frames = Vec::new();
                if let Some(msg) = error {
                    let annotation = serde_json::json!({ "error": { "message": msg } });
                    frames.push(format!("data: {annotation}\n\n"));
                }
                frames.push("data: [DONE]\n\n".to_string());
                frames
            }
        }
    }

    fn ollama_frame(
        &self,
        delta: &str,
        done: bool,
        done_reason: Option<String>,
        error: Option<&str>,
    ) -> String {
        let usage = self.usage.unwrap_or_default();
        let (prompt_eval_count, eval_count) = if done {
            (Some(usage.prompt_tokens), Some(usage.completion_tokens))
        } else {
            (None, None)
        };

        let json = match self.operation {
            Operation::Generate => serde_json::to_string(&GenerateResponse {
                model: self.model.clone(),
                created_at: self.created_at,
                response: delta.to_string(),
                done,
                done_reason,
                prompt_eval_count,
                eval_count,
                total_duration: None,
                error: error.map(String::from),
            }),
            Operation::Chat => serde_json::to_string(&ChatResponse {
                model: self.model.clone(),
                created_at: self.created_at,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: delta.to_string(),
                    images: None,
                },
                done,
                done_reason,
                prompt_eval_count,
                eval_count,
                total_duration: None,
                error: error.map(String::from),
            }),
        };

        // Serialization of these plain structs cannot fail
        let mut line = json.unwrap_or_default();
        line.push('\n');
        line
    }
}

/// Lift one upstream chunk into canonical form before dialect framing.
fn chunk_to_canonical(chunk: &ChatCompletionChunk) -> CanonicalChunk {
    let choice = chunk.choices.first();
    CanonicalChunk {
        delta: choice
            .and_then(|c| c.delta.content.clone())
            .unwrap_or_default(),
        finish_reason: choice.and_then(|c| c.finish_reason.clone()),
        usage: chunk.usage.as_ref().map(|u| UsageCounters {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }),
        done: choice.map_or(false, |c| c.finish_reason.is_some()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_chunk(content: &str, finish: Option<&str>) -> ChatCompletionChunk {
        serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": "gpt-3.5-turbo",
            "choices": [{
                "index": 0,
                "delta": if content.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::json!({"content": content})
                },
                "finish_reason": finish
            }]
        }))
        .unwrap()
    }

    fn usage_chunk(prompt: u64, completion: u64) -> ChatCompletionChunk {
        serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 1700000000,
            "model": "gpt-3.5-turbo",
            "choices": [],
            "usage": {
                "prompt_tokens": prompt,
                "completion_tokens": completion,
                "total_tokens": prompt + completion
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_chunks_emitted_in_order() {
        let mut tr = ChunkTranslator::new(Dialect::Ollama, Operation::Chat, "llama2", Utc::now());

        let frames: Vec<String> = ["A", "B", "C"]
            .iter()
            .filter_map(|c| tr.translate_chunk(&text_chunk(c, None)))
            .collect();

        assert_eq!(frames.len(), 3);
        for (frame, expected) in frames.iter().zip(["A", "B", "C"]) {
            let parsed: ChatResponse = serde_json::from_str(frame.trim()).unwrap();
            assert_eq!(parsed.message.content, expected);
            assert_eq!(parsed.model, "llama2");
            assert!(!parsed.done);
        }
    }

    #[test]
    fn test_terminal_frame_carries_counters() {
        let mut tr =
            ChunkTranslator::new(Dialect::Ollama, Operation::Generate, "llama2", Utc::now());

        assert!(tr.translate_chunk(&text_chunk("hello", None)).is_some());
        // Finish chunk and usage chunk produce no frames of their own
        assert!(tr.translate_chunk(&text_chunk("", Some("stop"))).is_none());
        assert!(tr.translate_chunk(&usage_chunk(3, 7)).is_none());

        let frames = tr.finish(None);
        assert_eq!(frames.len(), 1);
        let parsed: GenerateResponse = serde_json::from_str(frames[0].trim()).unwrap();
        assert!(parsed.done);
        assert_eq!(parsed.done_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.prompt_eval_count, Some(3));
        assert_eq!(parsed.eval_count, Some(7));
        assert!(parsed.error.is_none());
    }

    #[test]
    fn test_error_annotation_on_broken_stream() {
        let mut tr = ChunkTranslator::new(Dialect::Ollama, Operation::Chat, "llama2", Utc::now());

        assert!(tr.translate_chunk(&text_chunk("A", None)).is_some());
        assert!(tr.translate_chunk(&text_chunk("B", None)).is_some());

        let frames = tr.finish(Some("upstream connection lost"));
        assert_eq!(frames.len(), 1);
        let parsed: ChatResponse = serde_json::from_str(frames[0].trim()).unwrap();
        assert!(parsed.done);
        assert_eq!(parsed.done_reason.as_deref(), Some("error"));
        assert_eq!(parsed.error.as_deref(), Some("upstream connection lost"));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut tr = ChunkTranslator::new(Dialect::Ollama, Operation::Chat, "m", Utc::now());
        assert_eq!(tr.finish(None).len(), 1);
        assert!(tr.finish(None).is_empty());
        assert!(tr.translate_chunk(&text_chunk("late", None)).is_none());
    }

    #[test]
    fn test_openai_dialect_rewrites_model_and_terminates() {
        let mut tr = ChunkTranslator::new(Dialect::OpenAi, Operation::Chat, "llama2", Utc::now());

        let frame = tr.translate_chunk(&text_chunk("hi", None)).unwrap();
        assert!(frame.starts_with("data: "));
        let parsed: ChatCompletionChunk =
            serde_json::from_str(frame.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(parsed.model, "llama2");

        let frames = tr.finish(None);
        assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");
    }
}
