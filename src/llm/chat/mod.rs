pub mod openai;
pub mod gemini;

use async_trait::async_trait;
use futures::{ Stream, StreamExt, Future };
use log::debug;
use serde::Deserialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{ ChunkMode, LlmConfig, LlmType };
use super::sse::{ SseDecoder, SseEvent };
use self::gemini::GeminiChatClient;
use self::openai::OpenAIChatClient;
use crate::error::{ ChatError, ChatResult };
use crate::models::chat::ChatMessage;

/// Ordered text deltas for one reply. The stream ends after the last delta; an `Err` item
/// is the last item.
pub type DeltaStream = Pin<Box<dyn Stream<Item = ChatResult<String>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { system_prompt: None, messages }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = if prompt.trim().is_empty() { None } else { Some(prompt) };
        self
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Sends the conversation and returns its reply as a stream of deltas. Resolves once
    /// the response headers arrived; a non-success status is returned as
    /// `ChatError::Transport`. `cancel` aborts the transport.
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken
    ) -> ChatResult<DeltaStream>;

    fn get_model(&self) -> String;
    fn get_base_url(&self) -> Option<String>;
    fn get_llm_type(&self) -> LlmType;
}

pub fn create_streaming_response<F, Fut>(response_fn: F) -> DeltaStream
    where
        F: FnOnce(mpsc::Sender<ChatResult<String>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static
{
    let (tx, rx) = mpsc::channel(32);

    tokio::spawn(async move {
        response_fn(tx).await;
    });

    Box::pin(ReceiverStream::new(rx))
}

/// Replays a complete reply as a stream, one fragment per `delay`.
pub fn full_response_as_stream(
    text: String,
    mode: ChunkMode,
    delay: Duration,
    cancel: CancellationToken
) -> DeltaStream {
    create_streaming_response(move |tx| async move {
        for (i, fragment) in split_fragments(&text, mode).into_iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return;
            }
            if tx.send(Ok(fragment)).await.is_err() {
                return;
            }
        }
    })
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '؟' | '۔' | '…')
}

/// Splits `text` on word or sentence boundaries. Whitespace stays attached to the fragment
/// before it, so the fragments concatenate back to `text` exactly.
pub fn split_fragments(text: &str, mode: ChunkMode) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();

    match mode {
        ChunkMode::Words => {
            let mut in_space = false;
            for c in text.chars() {
                if !c.is_whitespace() && in_space && !current.is_empty() {
                    fragments.push(std::mem::take(&mut current));
                }
                in_space = c.is_whitespace();
                current.push(c);
            }
        }
        ChunkMode::Sentences => {
            let mut after_end = false;
            let mut saw_space = false;
            for c in text.chars() {
                if after_end && saw_space && !c.is_whitespace() {
                    fragments.push(std::mem::take(&mut current));
                    after_end = false;
                    saw_space = false;
                }
                if is_sentence_end(c) {
                    after_end = true;
                    saw_space = false;
                } else if c.is_whitespace() {
                    saw_space = after_end;
                } else {
                    after_end = false;
                }
                current.push(c);
            }
        }
    }

    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

/// Decodes an SSE response body into deltas on a background task. The task ends at
/// `[DONE]`, at the end of the body, on the first transport error, or on cancellation,
/// which drops the connection.
pub fn sse_delta_stream(response: reqwest::Response, cancel: CancellationToken) -> DeltaStream {
    create_streaming_response(move |tx| async move {
        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("SSE reader cancelled");
                    return;
                }
                chunk = bytes.next() => chunk,
            };

            let (events, ended) = match chunk {
                Some(Ok(buf)) => (decoder.feed(&buf), false),
                Some(Err(e)) => {
                    let _ = tx.send(Err(ChatError::from(e))).await;
                    return;
                }
                None => (decoder.finish(), true),
            };

            for event in events {
                match event {
                    SseEvent::Delta(text) => {
                        if tx.send(Ok(text)).await.is_err() {
                            return;
                        }
                    }
                    SseEvent::Failed(message) => {
                        let _ = tx.send(Err(ChatError::transport(None, message))).await;
                        return;
                    }
                    SseEvent::Done => {
                        return;
                    }
                }
            }

            if ended {
                if let Some(err) = decoder.last_error() {
                    debug!("SSE body ended after {} dropped record(s), last: {}", decoder.dropped_records(), err);
                }
                return;
            }
        }
    })
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Maps a non-success response to `ChatError::Transport`, preferring the provider's
/// `{"error": {"message": ...}}` text over the raw body.
pub async fn error_from_response(response: reqwest::Response) -> ChatError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => envelope.error.message,
        Err(_) if !body.trim().is_empty() => body.trim().to_string(),
        Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
    };
    ChatError::transport(Some(status.as_u16()), message)
}

pub fn new_client(config: &LlmConfig) -> ChatResult<Arc<dyn ChatClient>> {
    let client: Arc<dyn ChatClient> = match config.llm_type {
        LlmType::OpenRouter | LlmType::OpenAI => {
            let specific_client = OpenAIChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
        LlmType::Gemini => {
            let specific_client = GeminiChatClient::from_config(config)?;
            Arc::new(specific_client)
        }
    };
    Ok(client)
}
