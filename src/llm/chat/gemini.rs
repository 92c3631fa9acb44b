use async_trait::async_trait;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use log::info;
use reqwest::Client as HttpClient;
use tokio_util::sync::CancellationToken;

use super::{ChatClient, ChatRequest, DeltaStream, error_from_response, full_response_as_stream};
use crate::error::{ChatError, ChatResult};
use crate::llm::{ChunkMode, LlmConfig, LlmType};
use crate::models::chat::Role;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent<'a> {
    role: &'a str,
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiInstruction<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleCandidate {
    content: Option<GoogleContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Deserialize)]
struct GooglePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn gemini_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "model",
    }
}

fn build_request<'a>(request: &'a ChatRequest, temperature: f32, max_tokens: u32) -> GeminiRequest<'a> {
    GeminiRequest {
        contents: request.messages
            .iter()
            .filter(|m| !m.content.is_empty())
            .map(|m| GeminiContent {
                role: gemini_role(m.role),
                parts: vec![GeminiPart { text: &m.content }],
            })
            .collect(),
        system_instruction: request.system_prompt
            .as_deref()
            .map(|text| GeminiInstruction { parts: vec![GeminiPart { text }] }),
        generation_config: GenerationConfig {
            temperature,
            max_output_tokens: max_tokens,
        },
    }
}

/// Pulls the reply text out of a `generateContent` response.
fn extract_text(response: GoogleResponse) -> ChatResult<String> {
    let block_reason = response.prompt_feedback.and_then(|f| f.block_reason);
    let candidate = response.candidates.into_iter().next();
    let finish_reason = candidate.as_ref().and_then(|c| c.finish_reason.clone());

    let text: String = candidate
        .and_then(|c| c.content)
        .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.is_empty() {
        let reason = block_reason
            .or(finish_reason)
            .unwrap_or_else(|| "no candidates".to_string());
        return Err(ChatError::transport(None, format!("Gemini returned no text ({})", reason)));
    }
    Ok(text)
}

/// Gemini client. `generateContent` answers in one piece; the reply is replayed as a
/// stream of word or sentence fragments so callers see the same incremental behavior as
/// with a streaming backend.
pub struct GeminiChatClient {
    http: HttpClient,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_tokens: u32,
    chunk_mode: ChunkMode,
    chunk_delay: Duration,
}

impl GeminiChatClient {
    pub fn new(
        api_key: String,
        model: Option<String>,
        base_url: Option<String>,
        temperature: f32,
        max_tokens: u32,
        chunk_mode: ChunkMode,
        chunk_delay: Duration,
    ) -> ChatResult<Self> {
        let chat_model = model.unwrap_or_else(|| "gemini-1.5-flash-latest".to_string());
        let base_url = base_url.unwrap_or_else(|| GEMINI_BASE_URL.to_string());
        let http = HttpClient::builder()
            .build()
            .map_err(|e| ChatError::Config(e.to_string()))?;

        Ok(Self {
            http,
            api_key,
            model: chat_model,
            base_url,
            temperature,
            max_tokens,
            chunk_mode,
            chunk_delay,
        })
    }

    pub fn from_config(config: &LlmConfig) -> ChatResult<Self> {
        let api_key = config.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ChatError::Config("Google API key is required for GeminiChatClient".to_string()))?;

        Self::new(
            api_key,
            config.completion_model.clone(),
            config.base_url.clone(),
            config.temperature,
            config.max_tokens,
            config.chunk_mode,
            config.chunk_delay,
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url.trim_end_matches('/'), self.model)
    }

    pub async fn generate(&self, request: &ChatRequest) -> ChatResult<String> {
        let payload = build_request(request, self.temperature, self.max_tokens);
        info!(
            "GeminiChatClient::generate() → model={} contents={}",
            self.model,
            payload.contents.len()
        );

        let resp = self.http
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        let body = resp.json::<GoogleResponse>().await?;
        extract_text(body)
    }
}

#[async_trait]
impl ChatClient for GeminiChatClient {
    async fn stream_chat(
        &self,
        request: &ChatRequest,
        cancel: CancellationToken
    ) -> ChatResult<DeltaStream> {
        let text = self.generate(request).await?;
        Ok(full_response_as_stream(text, self.chunk_mode, self.chunk_delay, cancel))
    }

    fn get_model(&self) -> String {
        self.model.clone()
    }

    fn get_base_url(&self) -> Option<String> {
        Some(self.base_url.clone())
    }

    fn get_llm_type(&self) -> LlmType {
        LlmType::Gemini
    }
}
