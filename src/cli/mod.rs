use clap::Parser;
use std::time::Duration;

use crate::agent::RollbackPolicy;
use crate::error::{ ChatError, ChatResult };
use crate::llm::{ ChunkMode, LlmConfig, parse_llm_type };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for chat completion (openrouter, openai, gemini)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "openrouter")]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API. Adapters fall back to the public endpoint.
    #[arg(long, env = "CHAT_BASE_URL")]
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider
    #[arg(long, env = "CHAT_API_KEY", default_value = "")]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., openai/gpt-4o-mini, gemini-1.5-flash-latest)
    #[arg(long, env = "CHAT_MODEL")]
    pub chat_model: Option<String>,

    #[arg(long, env = "CHAT_TEMPERATURE", default_value = "0.7")]
    pub chat_temperature: f32,

    #[arg(long, env = "CHAT_MAX_TOKENS", default_value = "2048")]
    pub chat_max_tokens: u32,

    /// Site URL sent to OpenRouter as `HTTP-Referer` for app attribution.
    #[arg(long, env = "OPENROUTER_REFERER")]
    pub openrouter_referer: Option<String>,

    /// App name sent to OpenRouter as `X-Title`.
    #[arg(long, env = "OPENROUTER_TITLE")]
    pub openrouter_title: Option<String>,

    // --- Simulated Streaming Args ---
    /// How non-streaming replies are cut up (words, sentences)
    #[arg(long, env = "SIMULATED_CHUNKING", default_value = "words")]
    pub simulated_chunking: String,

    /// Pause between simulated fragments, in milliseconds.
    #[arg(long, env = "SIMULATED_DELAY_MS", default_value = "30")]
    pub simulated_delay_ms: u64,

    // --- History Store Args ---
    /// History chat store type (memory, redis, none)
    #[arg(long, env = "HISTORY_TYPE", default_value = "memory")]
    pub history_type: String,

    /// History chat store host endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "HISTORY_HOST", default_value = "redis://127.0.0.1:6379")]
    pub history_host: String,

    /// Prefix for Redis history keys.
    #[arg(long, env = "HISTORY_REDIS_PREFIX", default_value = "history:")]
    pub history_redis_prefix: String,

    /// What happens to the question when a request fails (remove, keep)
    #[arg(long, env = "ROLLBACK_POLICY", default_value = "remove")]
    pub rollback_policy: String,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,

    /// Path to the prompt configuration file. The built-in prompt is used when it is missing.
    #[arg(long, env = "PROMPTS_PATH", default_value = "json/prompts.json")]
    pub prompts_path: String,

    /// Host address and port for the WebSocket server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    /// Port for the HTTP API. Disabled when unset.
    #[arg(long, env = "HTTP_PORT")]
    pub http_port: Option<u16>,
}

impl Args {
    pub fn llm_config(&self) -> ChatResult<LlmConfig> {
        let llm_type = parse_llm_type(&self.chat_llm_type).map_err(ChatError::Config)?;
        let chunk_mode = self.simulated_chunking
            .parse::<ChunkMode>()
            .map_err(|e| ChatError::Config(e.to_string()))?;

        Ok(LlmConfig {
            llm_type,
            api_key: non_empty(&self.chat_api_key),
            completion_model: self.chat_model.clone(),
            base_url: self.chat_base_url.clone(),
            temperature: self.chat_temperature,
            max_tokens: self.chat_max_tokens,
            referer: self.openrouter_referer.clone(),
            app_title: self.openrouter_title.clone(),
            chunk_mode,
            chunk_delay: Duration::from_millis(self.simulated_delay_ms),
        })
    }

    pub fn rollback_policy(&self) -> ChatResult<RollbackPolicy> {
        self.rollback_policy.parse().map_err(ChatError::Config)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}
