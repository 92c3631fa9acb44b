use async_trait::async_trait;
use log::info;
use reqwest::{Client as HttpClient, header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, AUTHORIZATION}};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{ChatClient, ChatRequest, DeltaStream, error_from_response, sse_delta_stream};
use crate::error::{ChatError, ChatResult};
use crate::llm::{LlmConfig, LlmType};

pub const OPENROUTER_CHAT_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Client for any OpenAI-compatible chat-completions endpoint that streams SSE
/// (`OpenRouter`, `OpenAI`, local gateways).
pub struct OpenAIChatClient {
    http: HttpClient,
    llm_type: LlmType,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize, Debug, PartialEq)]
struct OpenAIMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize, Debug)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

fn build_messages(request: &ChatRequest) -> Vec<OpenAIMessage<'_>> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(prompt) = &request.system_prompt {
        messages.push(OpenAIMessage { role: "system", content: prompt });
    }
    messages.extend(
        request.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| OpenAIMessage { role: m.role.as_str(), content: &m.content })
    );
    messages
}

impl OpenAIChatClient {
    pub fn new(
        llm_type: LlmType,
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        temperature: f32,
        max_tokens: u32,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> ChatResult<Self> {
        let (default_url, default_model) = match llm_type {
            LlmType::OpenAI => (OPENAI_CHAT_URL, "gpt-4o-mini"),
            _ => (OPENROUTER_CHAT_URL, "openai/gpt-4o-mini"),
        };
        let chat_model = model.unwrap_or_else(|| default_model.to_string());
        let api_url = base_url.unwrap_or_else(|| default_url.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|e| ChatError::Config(format!("Invalid API key format: {}", e)))?
        );
        if let Some(referer) = referer.filter(|r| !r.is_empty()) {
            headers.insert(
                "http-referer",
                HeaderValue::from_str(&referer)
                    .map_err(|e| ChatError::Config(format!("Invalid referer: {}", e)))?
            );
        }
        if let Some(title) = app_title.filter(|t| !t.is_empty()) {
            headers.insert(
                "x-title",
                HeaderValue::from_str(&title)
                    .map_err(|e| ChatError::Config(format!("Invalid app title: {}", e)))?
            );
        }

        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ChatError::Config(e.to_string()))?;

        Ok(Self {
            http,
            llm_type,
            model: chat_model,
            base_url: api_url,
            temperature,
            max_tokens,
        })
    }

    pub fn from_config(config: &LlmConfig) -> ChatResult<Self> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ChatError::Config(format!("{} API key is required", config.llm_type)))?;

        Self::new(
            config.llm_type,
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.temperature,
            config.max_tokens,
            config.referer.clone(),
            config.app_title.clone(),
        )
    }
}

#[async_trait]
impl ChatClient for OpenAIChatClient {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken
    ) -> ChatResult<DeltaStream> {
        let url = self.base_url.trim_end_matches('/').to_string();
        let body = OpenAIChatRequest {
            model: &self.model,
            messages: build_messages(request),
            stream: true,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        info!(
            "{} stream request → model={} messages={}",
            self.llm_type,
            self.model,
            body.messages.len()
        );

        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        Ok(sse_delta_stream(resp, cancel))
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    fn get_llm_type(&self) -> LlmType {
        self.llm_type
    }
}
