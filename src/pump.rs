//! Streaming pump: moves one upstream SSE byte stream into one downstream
//! dialect stream, frame by frame, without buffering the payload.
//!
//! Each complete `data:` record is decoded, fed through the
//! [`ChunkTranslator`], and yielded immediately. The upstream `[DONE]`
//! sentinel (or stream end) triggers the translator's own termination
//! marker. An upstream error mid-stream becomes one best-effort terminal
//! frame with an error annotation instead of a hung connection.
//!
//! Cancellation is by drop: when the client goes away axum drops this
//! stream, which drops the upstream response body and returns its
//! connection to the pool. Frames are yielded strictly in upstream order.

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::translate::openai_types::ChatCompletionChunk;
use crate::translate::streaming::ChunkTranslator;

/// How a pumped stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// Upstream completed, with or without its sentinel.
    Completed,
    /// Upstream failed mid-stream; a synthetic terminal frame was emitted.
    UpstreamError,
    /// The consumer dropped the stream before it finished.
    Cancelled,
}

/// Fires `on_end` exactly once: with the real outcome on a normal exit, or
/// with [`StreamEnd::Cancelled`] from `Drop` when the generator is dropped
/// mid-stream.
struct EndSignal<F: FnOnce(StreamEnd)> {
    on_end: Option<F>,
}

impl<F: FnOnce(StreamEnd)> EndSignal<F> {
    fn new(on_end: F) -> Self {
        Self {
            on_end: Some(on_end),
        }
    }

    fn end(&mut self, end: StreamEnd) {
        if let Some(f) = self.on_end.take() {
            f(end);
        }
    }
}

impl<F: FnOnce(StreamEnd)> Drop for EndSignal<F> {
    fn drop(&mut self) {
        if let Some(f) = self.on_end.take() {
            f(StreamEnd::Cancelled);
        }
    }
}

/// Bridge `byte_stream` to the dialect the translator was built for. The
/// output never yields `Err`; failures are folded into terminal frames so
/// the client always sees a well-formed end of stream. `on_end` is invoked
/// exactly once with how the stream terminated, on every exit path
/// including consumer drop.
pub fn pump<S, E, F>(
    byte_stream: S,
    mut translator: ChunkTranslator,
    request_id: uuid::Uuid,
    on_end: F,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnOnce(StreamEnd) + Send + 'static,
{
    async_stream::stream! {
        let mut signal = EndSignal::new(on_end);
        let mut buffer = String::new();

        tokio::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    warn!(%request_id, error = %e, "Upstream stream failed mid-flight");
                    for frame in translator.finish(Some("upstream connection lost")) {
                        yield Ok(Bytes::from(frame));
                    }
                    signal.end(StreamEnd::UpstreamError);
                    return;
                }
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete lines; a partial line stays in the buffer
            while let Some(newline_pos) = buffer.find('\n') {
                let line = buffer[..newline_pos].trim().to_string();
                buffer = buffer[newline_pos + 1..].to_string();

                if line.is_empty() {
                    continue;
                }

                let data = if let Some(stripped) = line.strip_prefix("data: ") {
                    stripped.trim()
                } else if let Some(stripped) = line.strip_prefix("data:") {
                    stripped.trim()
                } else {
                    continue;
                };

                if data == "[DONE]" {
                    for frame in translator.finish(None) {
                        yield Ok(Bytes::from(frame));
                    }
                    signal.end(StreamEnd::Completed);
                    debug!(%request_id, "Stream completed");
                    return;
                }

                let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(%request_id, error = %e, "Skipping unparseable chunk");
                        continue;
                    }
                };

                if let Some(frame) = translator.translate_chunk(&chunk) {
                    yield Ok(Bytes::from(frame));
                }
            }
        }

        // Upstream ended without its [DONE] sentinel; close out cleanly
        for frame in translator.finish(None) {
            yield Ok(Bytes::from(frame));
        }
        signal.end(StreamEnd::Completed);
        debug!(%request_id, "Stream ended without sentinel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::canonical::{Dialect, Operation};
    use crate::translate::ollama_types::ChatResponse;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    fn end_recorder() -> (Arc<Mutex<Option<StreamEnd>>>, impl FnOnce(StreamEnd)) {
        let seen = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&seen);
        (seen, move |end| {
            *writer.lock().unwrap() = Some(end);
        })
    }

    fn sse_data(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion.chunk",
                "created": 1700000000,
                "model": "gpt-3.5-turbo",
                "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
            })
        )
    }

    fn chat_translator() -> ChunkTranslator {
        ChunkTranslator::new(Dialect::Ollama, Operation::Chat, "llama2", Utc::now())
    }

    async fn collect_frames(
        stream: impl Stream<Item = std::io::Result<Bytes>>,
    ) -> Vec<ChatResponse> {
        futures::pin_mut!(stream);
        let mut frames = Vec::new();
        while let Some(item) = stream.next().await {
            let text = String::from_utf8(item.unwrap().to_vec()).unwrap();
            frames.push(serde_json::from_str(text.trim()).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_chunks_pass_through_in_order() {
        let upstream = tokio_stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from(sse_data("A"))),
            Ok(Bytes::from(sse_data("B"))),
            Ok(Bytes::from(sse_data("C"))),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]);

        let frames = collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), |_| {})).await;

        assert_eq!(frames.len(), 4);
        let deltas: Vec<&str> = frames[..3]
            .iter()
            .map(|f| f.message.content.as_str())
            .collect();
        assert_eq!(deltas, vec!["A", "B", "C"]);
        assert!(frames[3].done);
        assert!(frames[3].error.is_none());
    }

    #[tokio::test]
    async fn test_split_sse_record_across_read_boundaries() {
        // One data: record delivered in two byte chunks
        let record = sse_data("hello");
        let (first, second) = record.split_at(20);
        let upstream = tokio_stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from(first.to_string())),
            Ok(Bytes::from(second.to_string())),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]);

        let frames = collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), |_| {})).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message.content, "hello");
    }

    #[tokio::test]
    async fn test_mid_stream_disconnect_yields_synthetic_terminal_frame() {
        let upstream = tokio_stream::iter(vec![
            Ok(Bytes::from(sse_data("A"))),
            Ok(Bytes::from(sse_data("B"))),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )),
        ]);

        let frames = collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), |_| {})).await;

        // Exactly 2 translated chunks plus one synthetic terminal frame
        assert_eq!(frames.len(), 3);
        assert!(!frames[0].done);
        assert!(!frames[1].done);
        assert!(frames[2].done);
        assert_eq!(frames[2].done_reason.as_deref(), Some("error"));
        assert!(frames[2].error.is_some());
    }

    #[tokio::test]
    async fn test_missing_sentinel_still_terminates() {
        let upstream = tokio_stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(sse_data(
            "only",
        )))]);

        let frames = collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), |_| {})).await;
        assert_eq!(frames.len(), 2);
        assert!(frames[1].done);
        assert!(frames[1].error.is_none());
    }

    #[tokio::test]
    async fn test_end_signal_reports_completion() {
        let upstream = tokio_stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from(sse_data("A"))),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]);
        let (seen, on_end) = end_recorder();

        collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), on_end)).await;
        assert_eq!(*seen.lock().unwrap(), Some(StreamEnd::Completed));
    }

    #[tokio::test]
    async fn test_end_signal_reports_upstream_error() {
        let upstream = tokio_stream::iter(vec![
            Ok(Bytes::from(sse_data("A"))),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer",
            )),
        ]);
        let (seen, on_end) = end_recorder();

        collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), on_end)).await;
        assert_eq!(*seen.lock().unwrap(), Some(StreamEnd::UpstreamError));
    }

    #[tokio::test]
    async fn test_end_signal_reports_cancellation_on_drop() {
        let upstream = tokio_stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from(sse_data("A"))),
            Ok(Bytes::from(sse_data("B"))),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]);
        let (seen, on_end) = end_recorder();

        let mut stream = Box::pin(pump(
            upstream,
            chat_translator(),
            uuid::Uuid::new_v4(),
            on_end,
        ));
        // Consumer reads one frame and goes away
        assert!(stream.next().await.is_some());
        assert!(seen.lock().unwrap().is_none());
        drop(stream);

        assert_eq!(*seen.lock().unwrap(), Some(StreamEnd::Cancelled));
    }

    #[tokio::test]
    async fn test_unparseable_chunks_are_skipped() {
        let upstream = tokio_stream::iter(vec![
            Ok::<_, std::io::Error>(Bytes::from("data: {not json}\n\n".to_string())),
            Ok(Bytes::from(sse_data("ok"))),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ]);

        let frames = collect_frames(pump(upstream, chat_translator(), uuid::Uuid::new_v4(), |_| {})).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].message.content, "ok");
    }
}
